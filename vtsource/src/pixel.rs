//! RGB/YUV conversions and scaling for the standardized output path.
//!
//! All conversions use the BT.601 matrix. Scaling resamples with a
//! Lanczos (a = 3) kernel; the kernel is part of the output contract
//! because clients observe the produced pixels.

use image::{RgbImage, imageops};
use thiserror::Error;

// BT.601 luma coefficients (standard definition video)
const BT601_KR: f32 = 0.299;
const BT601_KG: f32 = 0.587;
const BT601_KB: f32 = 0.114;

#[derive(Debug, Error)]
pub enum PixelError {
    #[error("width must be even, got {0}")]
    OddWidth(u32),
    #[error("width and height must be even, got {0}x{1}")]
    OddDimensions(u32, u32),
}

/// A decoded frame: tightly packed row-major RGB, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            data,
        }
    }
}

fn rgb_pixel_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = f32::from(r);
    let g = f32::from(g);
    let b = f32::from(b);

    let y = BT601_KR * r + BT601_KG * g + BT601_KB * b;
    let u = (b - y) / (2.0 * (1.0 - BT601_KB)) + 128.0;
    let v = (r - y) / (2.0 * (1.0 - BT601_KR)) + 128.0;

    (clip(y), clip(u), clip(v))
}

fn clip(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

/// Full-resolution Y, U and V planes for `frame`, each `width * height` bytes.
pub fn rgb_to_yuv444(frame: &RgbFrame) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let pixels = frame.width as usize * frame.height as usize;
    let mut y_plane = Vec::with_capacity(pixels);
    let mut u_plane = Vec::with_capacity(pixels);
    let mut v_plane = Vec::with_capacity(pixels);

    for rgb in frame.data.chunks_exact(3) {
        let (y, u, v) = rgb_pixel_to_yuv(rgb[0], rgb[1], rgb[2]);
        y_plane.push(y);
        u_plane.push(u);
        v_plane.push(v);
    }

    (y_plane, u_plane, v_plane)
}

/// Packed 4:2:2 in UYVY byte order: `U Y0 V Y1` per pixel pair, chroma
/// averaged across adjacent columns. Output is `height * width * 2` bytes.
pub fn rgb_to_uyvy(frame: &RgbFrame) -> Result<Vec<u8>, PixelError> {
    if frame.width % 2 != 0 {
        return Err(PixelError::OddWidth(frame.width));
    }

    let (y, u, v) = rgb_to_yuv444(frame);
    let width = frame.width as usize;

    let mut out = Vec::with_capacity(y.len() * 2);
    for row in 0..frame.height as usize {
        for pair in 0..width / 2 {
            let i = row * width + pair * 2;
            let u_sub = ((u16::from(u[i]) + u16::from(u[i + 1])) / 2) as u8;
            let v_sub = ((u16::from(v[i]) + u16::from(v[i + 1])) / 2) as u8;
            out.extend_from_slice(&[u_sub, y[i], v_sub, y[i + 1]]);
        }
    }

    Ok(out)
}

/// Packed 4:2:2 in YUYV byte order: `Y0 U Y1 V` per pixel pair, same
/// subsampling rule as [`rgb_to_uyvy`].
pub fn rgb_to_yuyv(frame: &RgbFrame) -> Result<Vec<u8>, PixelError> {
    if frame.width % 2 != 0 {
        return Err(PixelError::OddWidth(frame.width));
    }

    let (y, u, v) = rgb_to_yuv444(frame);
    let width = frame.width as usize;

    let mut out = Vec::with_capacity(y.len() * 2);
    for row in 0..frame.height as usize {
        for pair in 0..width / 2 {
            let i = row * width + pair * 2;
            let u_sub = ((u16::from(u[i]) + u16::from(u[i + 1])) / 2) as u8;
            let v_sub = ((u16::from(v[i]) + u16::from(v[i + 1])) / 2) as u8;
            out.extend_from_slice(&[y[i], u_sub, y[i + 1], v_sub]);
        }
    }

    Ok(out)
}

/// Planar 4:2:0: full-resolution Y plane followed by U and V planes
/// subsampled by 2x2 block mean. Output is `width * height * 3 / 2` bytes.
pub fn rgb_to_yuv420p(frame: &RgbFrame) -> Result<Vec<u8>, PixelError> {
    if frame.width % 2 != 0 || frame.height % 2 != 0 {
        return Err(PixelError::OddDimensions(frame.width, frame.height));
    }

    let (y, u, v) = rgb_to_yuv444(frame);
    let width = frame.width as usize;
    let height = frame.height as usize;

    let mut out = Vec::with_capacity(width * height * 3 / 2);
    out.extend_from_slice(&y);
    for plane in [&u, &v] {
        for row in (0..height).step_by(2) {
            for col in (0..width).step_by(2) {
                let sum = u16::from(plane[row * width + col])
                    + u16::from(plane[row * width + col + 1])
                    + u16::from(plane[(row + 1) * width + col])
                    + u16::from(plane[(row + 1) * width + col + 1]);
                out.push((sum / 4) as u8);
            }
        }
    }

    Ok(out)
}

/// Inverse of [`rgb_to_uyvy`]: chroma replicated across each pixel pair,
/// then the inverse BT.601 matrix.
pub fn uyvy_to_rgb(uyvy: &[u8], width: u32, height: u32) -> RgbFrame {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);

    for group in uyvy
        .chunks_exact(width as usize * 2)
        .take(height as usize)
        .flat_map(|row| row.chunks_exact(4))
    {
        let u = f32::from(group[0]) - 128.0;
        let y0 = f32::from(group[1]);
        let v = f32::from(group[2]) - 128.0;
        let y1 = f32::from(group[3]);

        for y in [y0, y1] {
            let r = y + 1.402 * v;
            let g = y - 0.344136 * u - 0.714136 * v;
            let b = y + 1.772 * u;
            data.extend_from_slice(&[clip(r), clip(g), clip(b)]);
        }
    }

    RgbFrame::new(width, height, data)
}

/// Resample `frame` to the target dimensions with a Lanczos3 kernel.
/// Identity when the dimensions already match.
pub fn scale(frame: &RgbFrame, target_width: u32, target_height: u32) -> RgbFrame {
    if frame.width == target_width && frame.height == target_height {
        return frame.clone();
    }

    let img = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .expect("frame buffer matches its dimensions");
    let resized = imageops::resize(&img, target_width, target_height, imageops::FilterType::Lanczos3);

    RgbFrame::new(target_width, target_height, resized.into_raw())
}
