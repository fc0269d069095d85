//! Synthetic frame source for `stub://` URLs.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::Frame;

/// Colour of the moving patch. Matches the default composite key.
const PATCH_COLOR: [u8; 3] = [0, 255, 0];
/// Max per-channel noise added to the background.
const NOISE: u8 = 6;

/// Generates a scrolling gradient with a bouncing green patch.
///
/// The patch gives colour-key compositing something to replace, and the
/// scroll plus noise keeps consecutive frames distinct for classifiers.
pub struct SyntheticSource {
    settings: SourceSettings,
    frame_count: u64,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self::with_seed(settings, 0x5eed)
    }

    pub fn with_seed(settings: SourceSettings, seed: u64) -> Self {
        Self {
            settings,
            frame_count: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn patch_origin(&self) -> (u32, u32) {
        let w = self.settings.width;
        let h = self.settings.height;
        let size = patch_size(w, h);
        let span_x = w.saturating_sub(size).max(1) as u64;
        let span_y = h.saturating_sub(size).max(1) as u64;
        (
            bounce(self.frame_count * 3, span_x) as u32,
            bounce(self.frame_count * 2, span_y) as u32,
        )
    }

    fn render(&mut self) -> Result<Vec<u8>> {
        let width = self.settings.width;
        let height = self.settings.height;
        let format = self.settings.pixel_format;
        let bpp = format.bytes_per_pixel();
        let [ro, go, bo] = format.rgb_offsets();
        let size = patch_size(width, height);
        let (px, py) = self.patch_origin();
        let shift = (self.frame_count % width.max(1) as u64) as u32;

        let mut pixels = vec![u8::MAX; format.buffer_len(width, height)?];
        for (index, out) in pixels.chunks_exact_mut(bpp).enumerate() {
            let x = index as u32 % width.max(1);
            let y = index as u32 / width.max(1);
            let rgb = if x >= px && x < px + size && y >= py && y < py + size {
                PATCH_COLOR
            } else {
                let noise = self.rng.gen_range(0..=NOISE);
                [
                    (((x + shift) % width.max(1)) * 255 / width.max(1)) as u8 / 2 + noise,
                    (y * 255 / height.max(1)) as u8 / 3 + noise,
                    96u8.saturating_add(noise),
                ]
            };
            out[ro] = rgb[0];
            out[go] = rgb[1];
            out[bo] = rgb[2];
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{} {:?})",
            self.settings.url,
            self.settings.width,
            self.settings.height,
            self.settings.pixel_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.render()?;
        Frame::new(
            pixels,
            self.settings.width,
            self.settings.height,
            self.settings.pixel_format,
            self.frame_count,
        )
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }
}

fn patch_size(width: u32, height: u32) -> u32 {
    (width.min(height) / 4).max(1)
}

/// Triangle wave over `0..=span`.
fn bounce(t: u64, span: u64) -> u64 {
    let period = span * 2;
    let phase = t % period;
    if phase <= span {
        phase
    } else {
        period - phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn settings(format: PixelFormat) -> SourceSettings {
        SourceSettings {
            url: "stub://test".to_string(),
            width: 32,
            height: 24,
            pixel_format: format,
            ..SourceSettings::default()
        }
    }

    #[test]
    fn frames_are_numbered_in_arrival_order() -> Result<()> {
        let mut source = SyntheticSource::new(settings(PixelFormat::Rgb24));
        source.connect()?;
        let first = source.next_frame()?;
        let second = source.next_frame()?;
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_ne!(first.pixels(), second.pixels());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn frames_contain_key_coloured_patch() -> Result<()> {
        let mut source = SyntheticSource::new(settings(PixelFormat::Bgra32));
        let frame = source.next_frame()?;
        assert_eq!(frame.pixels().len(), 32 * 24 * 4);
        let patch = (0..(32 * 24))
            .filter(|i| frame.rgb_at(*i) == PATCH_COLOR)
            .count();
        assert_eq!(patch, 36);
        Ok(())
    }

    #[test]
    fn bounce_stays_in_range() {
        let values: Vec<u64> = (0..8).map(|t| bounce(t, 3)).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 2, 1, 0, 1]);
    }
}
