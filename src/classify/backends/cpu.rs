use anyhow::Result;

use crate::classify::backend::Classifier;
use crate::classify::result::Classification;
use crate::frame::PixelFormat;

/// Pixels sampled per frame; larger frames are strided.
const SAMPLE_BUDGET: usize = 4096;
const DARK_MAX: u8 = 48;
const BRIGHT_MIN: u8 = 208;

/// CPU backend that labels a frame by its dominant colour family.
#[derive(Default)]
pub struct CpuClassifier;

impl CpuClassifier {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Copy)]
enum Bucket {
    Dark,
    Bright,
    Red,
    Green,
    Blue,
}

impl Bucket {
    const ALL: [Bucket; 5] = [
        Bucket::Dark,
        Bucket::Bright,
        Bucket::Red,
        Bucket::Green,
        Bucket::Blue,
    ];

    fn of(rgb: [u8; 3]) -> Self {
        let [r, g, b] = rgb;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        if max <= DARK_MAX {
            Bucket::Dark
        } else if min >= BRIGHT_MIN {
            Bucket::Bright
        } else if r >= g && r >= b {
            Bucket::Red
        } else if g >= b {
            Bucket::Green
        } else {
            Bucket::Blue
        }
    }

    fn label(self) -> &'static str {
        match self {
            Bucket::Dark => "dark scene",
            Bucket::Bright => "bright scene",
            Bucket::Red => "red dominant",
            Bucket::Green => "green dominant",
            Bucket::Blue => "blue dominant",
        }
    }
}

impl Classifier for CpuClassifier {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn classify(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Option<Classification>> {
        let pixel_count = (width as usize) * (height as usize);
        let bpp = format.bytes_per_pixel();
        if pixel_count == 0 || pixels.len() < pixel_count * bpp {
            return Ok(None);
        }

        let [ro, go, bo] = format.rgb_offsets();
        let step = (pixel_count / SAMPLE_BUDGET).max(1);
        let mut counts = [0usize; 5];
        let mut sampled = 0usize;
        for index in (0..pixel_count).step_by(step) {
            let base = index * bpp;
            let rgb = [pixels[base + ro], pixels[base + go], pixels[base + bo]];
            counts[Bucket::of(rgb) as usize] += 1;
            sampled += 1;
        }

        let (best, count) = Bucket::ALL
            .iter()
            .map(|bucket| (*bucket, counts[*bucket as usize]))
            .max_by_key(|(_, count)| *count)
            .unwrap_or((Bucket::Dark, 0));

        Ok(Some(Classification::new(
            best.label(),
            count as f32 / sampled as f32,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_classifier_labels_dominant_colour() {
        let mut classifier = CpuClassifier::new();

        let red = [200u8, 10, 10].repeat(16);
        let result = classifier
            .classify(&red, 4, 4, PixelFormat::Rgb24)
            .unwrap()
            .unwrap();
        assert_eq!(result.label, "red dominant");
        assert_eq!(result.confidence, 1.0);

        // BGRA with blue stored first.
        let blue = [220u8, 30, 30, 255].repeat(16);
        let result = classifier
            .classify(&blue, 4, 4, PixelFormat::Bgra32)
            .unwrap()
            .unwrap();
        assert_eq!(result.label, "blue dominant");

        let dark = vec![5u8; 48];
        let result = classifier
            .classify(&dark, 4, 4, PixelFormat::Rgb24)
            .unwrap()
            .unwrap();
        assert_eq!(result.label, "dark scene");
    }

    #[test]
    fn cpu_classifier_reports_nothing_for_empty_frames() {
        let mut classifier = CpuClassifier::new();
        assert!(classifier
            .classify(&[], 0, 0, PixelFormat::Rgb24)
            .unwrap()
            .is_none());
    }
}
