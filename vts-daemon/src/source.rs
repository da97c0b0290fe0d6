use std::path::{Path, PathBuf};
use std::thread;

use bytes::Bytes;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vtsource::formats::{PixelLayout, VideoFormat};
use vtsource::pixel::{self, PixelError};

use crate::cache::FrameCache;
use crate::decode::{Decode, DecodeError};

/// Default number of output-formatted frames kept in the cache.
pub const DEFAULT_CACHE_SIZE: usize = 30;

/// Advisory playback state; clients pull frames, nothing self-advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

impl PlayState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED",
        }
    }
}

/// Metadata of the loaded source, as reported by the decoder.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub frame_rate: f64,
    pub duration_seconds: f64,
    pub codec: String,
    pub pixel_format: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no file loaded")]
    NotLoaded,
    #[error("frame not available")]
    FrameUnavailable,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Pixel(#[from] PixelError),
}

/// The playback state machine: owns the decoder handle, the frame cache
/// and the output format, and turns decoded frames into output-formatted
/// payload bytes.
pub struct VideoSource<D> {
    output_format: VideoFormat,
    cache: FrameCache,
    decoder: Option<D>,
    info: Option<SourceInfo>,
    state: PlayState,
    current_frame: u64,
    looping: bool,
}

impl<D: Decode> VideoSource<D> {
    pub fn new(output_format: VideoFormat, cache_size: usize) -> Self {
        Self {
            output_format,
            cache: FrameCache::new(cache_size),
            decoder: None,
            info: None,
            state: PlayState::Stopped,
            current_frame: 0,
            looping: false,
        }
    }

    /// Replace any loaded source with the file at `path`. On success the
    /// position resets to frame 0, playback stops and the cache is
    /// cleared; on failure the engine is left unloaded.
    pub fn load(&mut self, path: &Path) -> Result<u64, SourceError> {
        self.close();

        let (decoder, info) = D::open(path)?;
        info!(
            "Loaded: {} ({} frames, {}x{})",
            path.display(),
            info.frame_count,
            info.width,
            info.height
        );

        let total = info.frame_count;
        self.decoder = Some(decoder);
        self.info = Some(info);
        Ok(total)
    }

    /// Release the loaded source. Idempotent.
    pub fn close(&mut self) {
        self.decoder = None;
        self.info = None;
        self.state = PlayState::Stopped;
        self.current_frame = 0;
        self.cache.clear();
    }

    /// Seek to `frame`; negative values count from the end. The target is
    /// clamped into `[0, total)` before the decoder seek.
    pub fn seek(&mut self, frame: i64) -> Result<u64, SourceError> {
        let total = self.total_frames();
        let decoder = self.decoder.as_mut().ok_or(SourceError::NotLoaded)?;

        let frame = if frame < 0 { total as i64 + frame } else { frame };
        let frame = frame.max(0).min(total.saturating_sub(1) as i64) as u64;

        decoder.seek(frame)?;
        self.current_frame = frame;
        Ok(frame)
    }

    /// Fetch frame `frame` (or the current frame when `None`) in the
    /// output format. Served from the cache when possible; otherwise the
    /// decoder is positioned, one frame is decoded, standardized and
    /// cached. Returns the served frame number with the payload.
    pub fn get_frame(&mut self, frame: Option<i64>) -> Result<(u64, Bytes), SourceError> {
        let total = self.total_frames();
        if self.decoder.is_none() {
            return Err(SourceError::NotLoaded);
        }

        let frame = match frame {
            Some(n) => n.max(0).min(total.saturating_sub(1) as i64) as u64,
            None => self.current_frame,
        };

        if let Some(data) = self.cache.get(frame) {
            self.current_frame = frame;
            return Ok((frame, data));
        }

        let decoder = self.decoder.as_mut().ok_or(SourceError::NotLoaded)?;
        if frame != self.current_frame {
            decoder.seek(frame)?;
        }

        let rgb = decoder
            .decode_next()?
            .ok_or(SourceError::FrameUnavailable)?;
        let scaled = pixel::scale(&rgb, self.output_format.width, self.output_format.height);
        let data = match self.output_format.layout {
            PixelLayout::Rgb24 => Bytes::from(scaled.data),
            PixelLayout::Yuv422 => Bytes::from(pixel::rgb_to_uyvy(&scaled)?),
            PixelLayout::Yuv420p => Bytes::from(pixel::rgb_to_yuv420p(&scaled)?),
        };

        self.cache.put(frame, data.clone());
        self.current_frame = frame;
        Ok((frame, data))
    }

    /// Step forward one frame, wrapping to 0 when looping. Returns false
    /// at the end of a non-looping source.
    pub fn advance(&mut self) -> bool {
        let Some(info) = &self.info else {
            return false;
        };

        if self.current_frame + 1 < info.frame_count {
            self.current_frame += 1;
            true
        } else if self.looping {
            if let Some(decoder) = self.decoder.as_mut() {
                let _ = decoder.seek(0);
            }
            self.current_frame = 0;
            true
        } else {
            false
        }
    }

    /// Step back one frame. Returns false at the start.
    pub fn retreat(&mut self) -> bool {
        if self.current_frame > 0 {
            self.current_frame -= 1;
            true
        } else {
            false
        }
    }

    /// Replace the output format. Cached frames were rendered for the old
    /// format, so the cache is invalidated.
    pub fn set_output_format(&mut self, format: VideoFormat) {
        self.output_format = format;
        self.cache.clear();
    }

    pub fn output_format(&self) -> VideoFormat {
        self.output_format
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn set_state(&mut self, state: PlayState) {
        self.state = state;
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn total_frames(&self) -> u64 {
        self.info.as_ref().map_or(0, |info| info.frame_count)
    }

    pub fn is_loaded(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn info(&self) -> Option<&SourceInfo> {
        self.info.as_ref()
    }
}

type Job<D> = Box<dyn FnOnce(&mut VideoSource<D>) + Send>;

/// Handle to the engine worker. Every operation funnels through a single
/// queue onto a dedicated thread owning the [`VideoSource`], so engine
/// operations execute strictly one at a time no matter how many
/// connections share the handle.
pub struct SourceHandle<D: Decode> {
    jobs: mpsc::UnboundedSender<Job<D>>,
}

impl<D: Decode> Clone for SourceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<D: Decode + 'static> SourceHandle<D> {
    /// Spawn the worker thread owning a fresh engine. The thread exits
    /// when the last handle is dropped.
    pub fn spawn(output_format: VideoFormat, cache_size: usize) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<D>>();

        thread::Builder::new()
            .name("video-source".to_string())
            .spawn(move || {
                let mut source = VideoSource::new(output_format, cache_size);
                while let Some(job) = queue.blocking_recv() {
                    job(&mut source);
                }
                debug!("source worker exiting");
            })
            .expect("failed to spawn source worker");

        Self { jobs }
    }

    /// Run `operation` against the engine on its worker thread and await
    /// the result.
    pub async fn with<F, R>(&self, operation: F) -> R
    where
        F: FnOnce(&mut VideoSource<D>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job<D> = Box::new(move |source| {
            let _ = reply.send(operation(source));
        });
        self.jobs.send(job).expect("source worker terminated");
        response.await.expect("source worker dropped the reply")
    }
}
