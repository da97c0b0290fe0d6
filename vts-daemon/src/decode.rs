use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;

use ffmpeg::Rational;
use ffmpeg::codec;
use ffmpeg::format::{self, Pixel};
use ffmpeg::frame;
use ffmpeg::media::Type;
use ffmpeg::software::scaling;
use log::debug;
use thiserror::Error;
use vtsource::pixel::RgbFrame;

use crate::source::SourceInfo;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no video stream in {}", .0.display())]
    NoVideoStream(PathBuf),
    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),
}

/// Demuxer/decoder seam. `open` yields a handle plus source metadata,
/// `seek` lands on the keyframe at or before the target frame, and
/// `decode_next` produces RGB frames until end of stream. Dropping the
/// handle releases the underlying resources.
pub trait Decode: Sized {
    fn open(path: &Path) -> Result<(Self, SourceInfo), DecodeError>;
    fn seek(&mut self, frame: u64) -> Result<(), DecodeError>;
    fn decode_next(&mut self) -> Result<Option<RgbFrame>, DecodeError>;
}

/// Container decoding through libavformat/libavcodec, with swscale
/// converting whatever the codec emits to packed RGB24 at the source's
/// native resolution.
pub struct FfmpegDecoder {
    input: format::context::Input,
    decoder: codec::decoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    time_base: Rational,
    frame_rate: f64,
    eof_sent: bool,
}

impl Decode for FfmpegDecoder {
    fn open(path: &Path) -> Result<(Self, SourceInfo), DecodeError> {
        ffmpeg::init()?;

        let input = format::input(&path)?;
        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| DecodeError::NoVideoStream(path.to_path_buf()))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let reported_frames = stream.frames();
        let duration = stream.duration();
        let avg_rate = stream.avg_frame_rate();
        let parameters = stream.parameters();

        let frame_rate = if avg_rate.numerator() > 0 {
            f64::from(avg_rate)
        } else {
            30.0
        };

        let decoder = codec::context::Context::from_parameters(parameters)?
            .decoder()
            .video()?;
        let scaler = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::Flags::BILINEAR,
        )?;

        let width = decoder.width();
        let height = decoder.height();
        let codec_name = decoder
            .codec()
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let pixel_format = format!("{:?}", decoder.format()).to_lowercase();

        let mut this = Self {
            input,
            decoder,
            scaler,
            stream_index,
            time_base,
            frame_rate,
            eof_sent: false,
        };

        let frame_count = if reported_frames > 0 {
            reported_frames as u64
        } else if duration > 0 {
            (duration as f64 * f64::from(time_base) * frame_rate) as u64
        } else {
            // Last resort: decode the whole stream and rewind.
            debug!("{}: no frame count metadata, scanning", path.display());
            this.scan_frames()?
        };

        let info = SourceInfo {
            path: path.to_path_buf(),
            width,
            height,
            frame_count,
            frame_rate,
            duration_seconds: frame_count as f64 / frame_rate,
            codec: codec_name,
            pixel_format,
        };

        Ok((this, info))
    }

    fn seek(&mut self, frame: u64) -> Result<(), DecodeError> {
        let position = (frame as f64 / self.frame_rate / f64::from(self.time_base)) as i64;
        self.input.seek(position, ..=position)?;
        self.decoder.flush();
        self.eof_sent = false;
        Ok(())
    }

    fn decode_next(&mut self) -> Result<Option<RgbFrame>, DecodeError> {
        let mut decoded = frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            self.feed_packet();
        }
    }
}

impl FfmpegDecoder {
    /// Push the next packet of our stream into the decoder, or signal end
    /// of stream when the demuxer runs dry.
    fn feed_packet(&mut self) {
        let index = self.stream_index;
        let packet = self
            .input
            .packets()
            .find(|(stream, _)| stream.index() == index)
            .map(|(_, packet)| packet);

        match packet {
            Some(packet) => {
                // Corrupt packets are dropped; the decoder resynchronizes
                // on the next one.
                let _ = self.decoder.send_packet(&packet);
            }
            None => {
                let _ = self.decoder.send_eof();
                self.eof_sent = true;
            }
        }
    }

    fn convert(&mut self, decoded: &frame::Video) -> Result<RgbFrame, DecodeError> {
        let mut converted = frame::Video::empty();
        self.scaler.run(decoded, &mut converted)?;

        let width = converted.width();
        let height = converted.height();
        let stride = converted.stride(0);
        let raw = converted.data(0);
        let row_bytes = width as usize * 3;

        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            data.extend_from_slice(&raw[row * stride..row * stride + row_bytes]);
        }

        Ok(RgbFrame::new(width, height, data))
    }

    fn scan_frames(&mut self) -> Result<u64, DecodeError> {
        let mut count = 0u64;
        let mut decoded = frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                count += 1;
                continue;
            }
            if self.eof_sent {
                break;
            }
            self.feed_packet();
        }

        self.input.seek(0, ..=0)?;
        self.decoder.flush();
        self.eof_sent = false;

        Ok(count)
    }
}
