use anyhow::Result;

use super::{Strategy, StrategyKind};
use crate::config::{BlurSettings, MAX_BLUR_RADIUS};
use crate::frame::Frame;

/// Separable box blur with edge clamping.
pub struct Blur {
    radius: usize,
}

impl Blur {
    /// Radii above `MAX_BLUR_RADIUS` are clamped.
    pub fn new(settings: &BlurSettings) -> Self {
        Self {
            radius: settings.radius.min(MAX_BLUR_RADIUS) as usize,
        }
    }
}

impl Strategy for Blur {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Blur
    }

    fn process(&mut self, input: Frame) -> Result<Option<Frame>> {
        let width = input.width() as usize;
        let height = input.height() as usize;
        let bpp = input.format().bytes_per_pixel();
        if self.radius == 0 || width == 0 || height == 0 {
            return Frame::derive(&input, input.pixels().to_vec()).map(Some);
        }

        let mut horizontal = vec![0u8; input.pixels().len()];
        box_pass(
            input.pixels(),
            &mut horizontal,
            Axis::Rows,
            width,
            height,
            bpp,
            self.radius,
        );
        let mut output = vec![0u8; horizontal.len()];
        box_pass(
            &horizontal,
            &mut output,
            Axis::Columns,
            width,
            height,
            bpp,
            self.radius,
        );
        Frame::derive(&input, output).map(Some)
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Rows,
    Columns,
}

/// One running-sum pass along `axis`. Samples past the edge repeat the edge.
fn box_pass(
    src: &[u8],
    dst: &mut [u8],
    axis: Axis,
    width: usize,
    height: usize,
    bpp: usize,
    radius: usize,
) {
    let (lines, len) = match axis {
        Axis::Rows => (height, width),
        Axis::Columns => (width, height),
    };
    let window = (2 * radius + 1) as u32;
    let index = |line: usize, pos: usize, channel: usize| -> usize {
        let (x, y) = match axis {
            Axis::Rows => (pos, line),
            Axis::Columns => (line, pos),
        };
        (y * width + x) * bpp + channel
    };

    for line in 0..lines {
        for channel in 0..bpp {
            let at = |pos: usize| src[index(line, pos.min(len - 1), channel)] as u32;
            // Window for pos 0 is [-radius, radius], clamped.
            let mut sum = at(0) * radius as u32 + (0..=radius).map(at).sum::<u32>();
            for pos in 0..len {
                dst[index(line, pos, channel)] = ((sum + window / 2) / window) as u8;
                let leaving = at(pos.saturating_sub(radius));
                let entering = at(pos + radius + 1);
                sum = sum + entering - leaving;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn blur(radius: u32) -> Blur {
        Blur::new(&BlurSettings { radius })
    }

    #[test]
    fn zero_radius_copies_pixels() {
        let input = Frame::new((0..27).collect(), 3, 3, PixelFormat::Rgb24, 5).unwrap();
        let output = blur(0).process(input.clone()).unwrap().unwrap();
        assert_eq!(output, input);
        assert!(!output.shares_pixels_with(&input));
    }

    #[test]
    fn uniform_frame_is_unchanged() {
        let input = Frame::new(vec![90u8; 4 * 5 * 4], 4, 5, PixelFormat::Bgra32, 1).unwrap();
        let output = blur(3).process(input.clone()).unwrap().unwrap();
        assert_eq!(output.pixels(), input.pixels());
    }

    #[test]
    fn single_bright_pixel_spreads_evenly() {
        let mut data = vec![0u8; 3 * 3 * 3];
        // Center pixel, red channel.
        data[(3 + 1) * 3] = 255;
        let input = Frame::new(data, 3, 3, PixelFormat::Rgb24, 0).unwrap();
        let output = blur(1).process(input).unwrap().unwrap();
        let reds: Vec<u8> = output.pixels().chunks_exact(3).map(|px| px[0]).collect();
        // 255 / 9 rounded.
        assert!(reds.iter().all(|v| *v == 28), "reds = {:?}", reds);
        assert!(output.pixels().chunks_exact(3).all(|px| px[1] == 0 && px[2] == 0));
    }

    #[test]
    fn oversized_radius_is_clamped() {
        assert_eq!(blur(u32::MAX).radius, MAX_BLUR_RADIUS as usize);

        let input = Frame::new(vec![200u8; 5 * 4 * 3], 5, 4, PixelFormat::Rgb24, 3).unwrap();
        let output = blur(u32::MAX).process(input.clone()).unwrap().unwrap();
        assert_eq!(output.pixels(), input.pixels());
    }

    #[test]
    fn radius_larger_than_frame_is_safe() {
        let input = Frame::new(vec![10, 20, 30, 40, 50, 60], 2, 1, PixelFormat::Rgb24, 0).unwrap();
        let output = blur(10).process(input).unwrap().unwrap();
        assert_eq!(output.width(), 2);
        assert_eq!(output.pixels().len(), 6);
    }
}
