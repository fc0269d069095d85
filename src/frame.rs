//! Immutable frame container.
//!
//! A `Frame` is produced once by a frame source and then only read:
//! - Pixel bytes live behind an `Arc<[u8]>`, so handing a frame to the filter
//!   queue or the sink is a reference-count bump, never a copy.
//! - There is no mutable accessor. A strategy that alters a frame builds a new
//!   byte buffer and wraps it with `Frame::derive`, which keeps the sequence
//!   number of the input so ordering stays attributable.

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Pixel layout of a frame buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit R, G, B.
    #[default]
    Rgb24,
    /// Packed 8-bit B, G, R, A (the usual capture layout on desktop webcams).
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Bgra32 => 4,
        }
    }

    /// Byte offsets of the red, green and blue channels within one pixel.
    pub fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelFormat::Rgb24 => [0, 1, 2],
            PixelFormat::Bgra32 => [2, 1, 0],
        }
    }

    /// Expected buffer length for the given dimensions.
    pub fn buffer_len(self, width: u32, height: u32) -> Result<usize> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(self.bytes_per_pixel()))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgb24" | "rgb" => Ok(PixelFormat::Rgb24),
            "bgra32" | "bgra" => Ok(PixelFormat::Bgra32),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

/// One decoded image from the stream.
///
/// Cloning a frame shares the pixel storage.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Wrap a pixel buffer. Fails if the length does not match the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        let expected = format.buffer_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer length mismatch: expected {} bytes for {}x{} {:?}, got {}",
                expected,
                width,
                height,
                format,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            format,
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// Build a processed frame from `source`, keeping its geometry, format,
    /// sequence number and capture instant.
    pub fn derive(source: &Frame, data: Vec<u8>) -> Result<Self> {
        let mut frame = Self::new(
            data,
            source.width,
            source.height,
            source.format,
            source.sequence,
        )?;
        frame.captured_at = source.captured_at;
        Ok(frame)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Arrival order assigned by the frame source.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Time since capture, for latency reporting.
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }

    /// True when both frames share the same pixel storage.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Read the RGB triple of the pixel at `index` (in pixels, not bytes).
    pub fn rgb_at(&self, index: usize) -> [u8; 3] {
        let bpp = self.format.bytes_per_pixel();
        let [r, g, b] = self.format.rgb_offsets();
        let base = index * bpp;
        [self.data[base + r], self.data[base + g], self.data[base + b]]
    }
}

impl Frame {
    /// Copy the pixels into an `image::RgbImage` for resampling.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        rgb_image(&self.data, self.width, self.height, self.format)
    }

    /// Build a frame from an RGB image, converting into `format`.
    pub fn from_rgb_image(image: &RgbImage, format: PixelFormat, sequence: u64) -> Result<Self> {
        let (width, height) = image.dimensions();
        let bpp = format.bytes_per_pixel();
        let [ro, go, bo] = format.rgb_offsets();
        let mut data = vec![u8::MAX; format.buffer_len(width, height)?];
        for (pixel, out) in image.pixels().zip(data.chunks_exact_mut(bpp)) {
            out[ro] = pixel[0];
            out[go] = pixel[1];
            out[bo] = pixel[2];
        }
        Self::new(data, width, height, format, sequence)
    }
}

/// Convert a packed pixel slice into an `RgbImage`, dropping alpha.
pub fn rgb_image(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<RgbImage> {
    let expected = format.buffer_len(width, height)?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "expected {} bytes for {}x{} {:?}, received {}",
            expected,
            width,
            height,
            format,
            pixels.len()
        ));
    }
    let [ro, go, bo] = format.rgb_offsets();
    let rgb: Vec<u8> = pixels
        .chunks_exact(format.bytes_per_pixel())
        .flat_map(|px| [px[ro], px[go], px[bo]])
        .collect();
    RgbImage::from_raw(width, height, rgb).ok_or_else(|| anyhow!("RGB buffer size mismatch"))
}

impl fmt::Debug for Frame {
    // Pixel content is never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && self.data == other.data
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(Frame::new(vec![0u8; 11], 2, 2, PixelFormat::Rgb24, 0).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb24, 0).is_ok());
        assert!(Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Bgra32, 0).is_err());
    }

    #[test]
    fn clones_share_pixels() -> Result<()> {
        let frame = Frame::new(vec![7u8; 12], 2, 2, PixelFormat::Rgb24, 3)?;
        let copy = frame.clone();
        assert!(frame.shares_pixels_with(&copy));
        assert_eq!(frame, copy);
        Ok(())
    }

    #[test]
    fn derived_frame_keeps_sequence_and_geometry() -> Result<()> {
        let frame = Frame::new(vec![1u8; 16], 2, 2, PixelFormat::Bgra32, 42)?;
        let derived = Frame::derive(&frame, vec![2u8; 16])?;
        assert_eq!(derived.sequence(), 42);
        assert_eq!(derived.format(), PixelFormat::Bgra32);
        assert!(!derived.shares_pixels_with(&frame));
        assert!(Frame::derive(&frame, vec![2u8; 12]).is_err());
        Ok(())
    }

    #[test]
    fn rgb_at_respects_channel_order() -> Result<()> {
        let bgra = Frame::new(vec![10, 20, 30, 255], 1, 1, PixelFormat::Bgra32, 0)?;
        assert_eq!(bgra.rgb_at(0), [30, 20, 10]);
        let rgb = Frame::new(vec![10, 20, 30], 1, 1, PixelFormat::Rgb24, 0)?;
        assert_eq!(rgb.rgb_at(0), [10, 20, 30]);
        Ok(())
    }

    #[test]
    fn rgb_image_round_trip_keeps_channels() -> Result<()> {
        let bgra = Frame::new(vec![1, 2, 3, 255, 4, 5, 6, 255], 2, 1, PixelFormat::Bgra32, 9)?;
        let image = bgra.to_rgb_image()?;
        assert_eq!(image.get_pixel(0, 0).0, [3, 2, 1]);

        let back = Frame::from_rgb_image(&image, PixelFormat::Bgra32, 9)?;
        assert_eq!(back.pixels(), bgra.pixels());
        Ok(())
    }

    #[test]
    fn pixel_format_parses_aliases() {
        assert_eq!(PixelFormat::parse("RGB").unwrap(), PixelFormat::Rgb24);
        assert_eq!(PixelFormat::parse("bgra32").unwrap(), PixelFormat::Bgra32);
        assert!(PixelFormat::parse("nv12").is_err());
    }
}
