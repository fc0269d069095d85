use anyhow::Result;

use super::{Strategy, StrategyKind};
use crate::config::ColorMaskSettings;
use crate::frame::Frame;

/// Pulls every pixel towards a tint colour.
///
/// The remap is precomputed into one 256-entry table per channel, so
/// `process` is a table lookup per byte. Alpha is copied through.
pub struct ColorMask {
    lut: [[u8; 256]; 3],
}

impl ColorMask {
    pub fn new(settings: &ColorMaskSettings) -> Self {
        let strength = settings.strength.clamp(0.0, 1.0);
        let mut lut = [[0u8; 256]; 3];
        for (channel, table) in lut.iter_mut().enumerate() {
            let target = settings.tint[channel] as f32;
            for (value, entry) in table.iter_mut().enumerate() {
                let mixed = value as f32 * (1.0 - strength) + target * strength;
                *entry = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }
        Self { lut }
    }
}

impl Strategy for ColorMask {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ColorMask
    }

    fn process(&mut self, input: Frame) -> Result<Option<Frame>> {
        let format = input.format();
        let offsets = format.rgb_offsets();
        let mut output = input.pixels().to_vec();
        for pixel in output.chunks_exact_mut(format.bytes_per_pixel()) {
            for (channel, offset) in offsets.iter().enumerate() {
                pixel[*offset] = self.lut[channel][pixel[*offset] as usize];
            }
        }
        Frame::derive(&input, output).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn settings(strength: f32) -> ColorMaskSettings {
        ColorMaskSettings {
            tint: [255, 0, 0],
            strength,
        }
    }

    #[test]
    fn zero_strength_is_identity() {
        let input = Frame::new(vec![10, 20, 30, 40, 50, 60], 2, 1, PixelFormat::Rgb24, 1).unwrap();
        let output = ColorMask::new(&settings(0.0))
            .process(input.clone())
            .unwrap()
            .unwrap();
        assert_eq!(output.pixels(), input.pixels());
        assert!(!output.shares_pixels_with(&input));
    }

    #[test]
    fn full_strength_paints_tint_and_keeps_alpha() {
        let input = Frame::new(vec![10, 20, 30, 77], 1, 1, PixelFormat::Bgra32, 4).unwrap();
        let output = ColorMask::new(&settings(1.0))
            .process(input.clone())
            .unwrap()
            .unwrap();
        // BGRA: blue, green, red, alpha.
        assert_eq!(output.pixels(), &[0, 0, 255, 77]);
        assert_eq!(output.sequence(), 4);
        // The input frame is untouched.
        assert_eq!(input.pixels(), &[10, 20, 30, 77]);
    }

    #[test]
    fn half_strength_blends() {
        let input = Frame::new(vec![0, 100, 200], 1, 1, PixelFormat::Rgb24, 0).unwrap();
        let output = ColorMask::new(&settings(0.5)).process(input).unwrap().unwrap();
        assert_eq!(output.pixels(), &[128, 50, 100]);
    }
}
