//! Wire protocol: command tokenizer, response formatting and the binary
//! frame header exchanged between daemon and clients.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame header requires {size} bytes, got {0}", size = FrameHeader::SIZE)]
    HeaderTooShort(usize),
}

/// Numeric codes carried in `ERROR <code> <message>` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownCommand,
    InvalidArgument,
    FileNotFound,
    InternalError,
    NotLoaded,
}

impl ErrorCode {
    pub const fn code(self) -> u16 {
        match self {
            Self::UnknownCommand => 400,
            Self::InvalidArgument => 401,
            Self::FileNotFound => 404,
            Self::InternalError => 500,
            Self::NotLoaded => 501,
        }
    }
}

/// Command vocabulary accepted from clients. `HELLO` is server-initiated
/// and deliberately absent; a client sending it gets an unknown-command
/// error like any other stray token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Bye,
    List,
    Load,
    Play,
    Pause,
    Stop,
    Seek,
    Next,
    Prev,
    GetFrame,
    Format,
    Loop,
    Status,
    Info,
    Source,
    FrameInfo,
}

impl Command {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "BYE" => Some(Self::Bye),
            "LIST" => Some(Self::List),
            "LOAD" => Some(Self::Load),
            "PLAY" => Some(Self::Play),
            "PAUSE" => Some(Self::Pause),
            "STOP" => Some(Self::Stop),
            "SEEK" => Some(Self::Seek),
            "NEXT" => Some(Self::Next),
            "PREV" => Some(Self::Prev),
            "GETFRAME" => Some(Self::GetFrame),
            "FORMAT" => Some(Self::Format),
            "LOOP" => Some(Self::Loop),
            "STATUS" => Some(Self::Status),
            "INFO" => Some(Self::Info),
            "SOURCE" => Some(Self::Source),
            "FRAMEINFO" => Some(Self::FrameInfo),
            _ => None,
        }
    }
}

/// Split a command line into the uppercased command token and its
/// arguments. Double quotes group an argument verbatim; an unmatched
/// opening quote consumes the rest of the line.
pub fn parse_command(line: &str) -> (String, Vec<String>) {
    let line = line.trim();
    if line.is_empty() {
        return (String::new(), Vec::new());
    }

    let (command, mut remainder) = match line.split_once(char::is_whitespace) {
        Some((command, remainder)) => (command, remainder),
        None => (line, ""),
    };

    let mut args = Vec::new();
    loop {
        remainder = remainder.trim_start();
        if remainder.is_empty() {
            break;
        }

        if let Some(quoted) = remainder.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    args.push(quoted[..end].to_string());
                    remainder = &quoted[end + 1..];
                }
                None => {
                    args.push(quoted.to_string());
                    break;
                }
            }
        } else {
            match remainder.find(' ') {
                Some(space) => {
                    args.push(remainder[..space].to_string());
                    remainder = &remainder[space + 1..];
                }
                None => {
                    args.push(remainder.to_string());
                    break;
                }
            }
        }
    }

    (command.to_uppercase(), args)
}

pub fn format_error(code: ErrorCode, message: &str) -> String {
    format!("ERROR {} {message}", code.code())
}

pub fn format_status(state: &str, frame: u64, total: u64) -> String {
    format!("OK STATUS {state} {frame} {total}")
}

bitflags! {
    /// Bitmap carried in the `flags` byte of the frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const KEYFRAME = 1;
        const FIELD_1 = 1 << 1;
        const FIELD_2 = 1 << 2;
        const END_OF_STREAM = 1 << 3;
    }
}

impl FrameFlags {
    /// Flags for frame `n` of a source with `total` frames: KEYFRAME on
    /// frame 0 only, END_OF_STREAM on the last frame.
    pub fn for_frame(n: u64, total: u64) -> Self {
        let mut flags = Self::empty();
        if n == 0 {
            flags |= Self::KEYFRAME;
        }
        if total > 0 && n == total - 1 {
            flags |= Self::END_OF_STREAM;
        }
        flags
    }
}

/// Binary header prepended to each transmitted frame.
///
/// Wire layout (16 bytes, big-endian):
/// `sequence(4) timestamp_ms(4) width(2) height(2) colorspace(1) flags(1) reserved(2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u32,
    pub timestamp_ms: u32,
    pub width: u16,
    pub height: u16,
    pub colorspace: u8,
    pub flags: FrameFlags,
    pub reserved: u16,
}

impl FrameHeader {
    pub const SIZE: usize = 16;

    pub fn pack(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut buf = &mut bytes[..];
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp_ms);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.colorspace);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.reserved);
        bytes
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::HeaderTooShort(data.len()));
        }

        let mut buf = data;
        Ok(Self {
            sequence: buf.get_u32(),
            timestamp_ms: buf.get_u32(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            colorspace: buf.get_u8(),
            flags: FrameFlags::from_bits_retain(buf.get_u8()),
            reserved: buf.get_u16(),
        })
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(FrameFlags::END_OF_STREAM)
    }
}
