use std::collections::HashMap;

use bytes::Bytes;

/// Bounded LRU cache of output-formatted frame payloads, keyed by frame
/// number.
///
/// Entries live in a slot arena threaded onto an intrusive doubly-linked
/// list ordered from least to most recently used, so lookups, promotion
/// and eviction are all O(1).
pub struct FrameCache {
    max_size: usize,
    map: HashMap<u64, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Least recently used entry.
    head: Option<usize>,
    /// Most recently used entry.
    tail: Option<usize>,
}

struct Slot {
    frame: u64,
    data: Bytes,
    prev: Option<usize>,
    next: Option<usize>,
}

impl FrameCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            map: HashMap::with_capacity(max_size),
            slots: Vec::with_capacity(max_size),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Fetch a cached frame, promoting it to most recently used.
    pub fn get(&mut self, frame: u64) -> Option<Bytes> {
        let index = *self.map.get(&frame)?;
        self.unlink(index);
        self.push_tail(index);
        Some(self.slots[index].data.clone())
    }

    /// Insert a frame, evicting the least recently used entry at capacity.
    /// Re-inserting an existing frame replaces its payload and promotes it.
    pub fn put(&mut self, frame: u64, data: Bytes) {
        if self.max_size == 0 {
            return;
        }

        if let Some(&index) = self.map.get(&frame) {
            self.slots[index].data = data;
            self.unlink(index);
            self.push_tail(index);
            return;
        }

        if self.map.len() >= self.max_size {
            if let Some(oldest) = self.head {
                self.unlink(oldest);
                self.map.remove(&self.slots[oldest].frame);
                self.free.push(oldest);
            }
        }

        let slot = Slot {
            frame,
            data,
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.map.insert(frame, index);
        self.push_tail(index);
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None if self.head == Some(index) => self.head = next,
            None => {}
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None if self.tail == Some(index) => self.tail = prev,
            None => {}
        }
        self.slots[index].prev = None;
        self.slots[index].next = None;
    }

    fn push_tail(&mut self, index: usize) {
        self.slots[index].prev = self.tail;
        self.slots[index].next = None;
        if let Some(tail) = self.tail {
            self.slots[tail].next = Some(index);
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
    }
}
