use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::classify::backend::Classifier;
use crate::classify::result::Classification;
use crate::frame::PixelFormat;

const STUB_LABELS: [&str; 8] = [
    "person", "cat", "dog", "chair", "monitor", "plant", "cup", "book",
];

/// Stub classifier for testing. Derives a stable label from a pixel hash.
///
/// Identical consecutive frames produce no output, so a frozen source does not
/// keep republishing the same label.
pub struct StubClassifier {
    last_hash: Option<[u8; 32]>,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self { last_hash: None }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(
        &mut self,
        pixels: &[u8],
        _width: u32,
        _height: u32,
        _format: PixelFormat,
    ) -> Result<Option<Classification>> {
        let current_hash: [u8; 32] = Sha256::digest(pixels).into();

        if self.last_hash == Some(current_hash) {
            return Ok(None);
        }
        self.last_hash = Some(current_hash);

        let label = STUB_LABELS[current_hash[0] as usize % STUB_LABELS.len()];
        let confidence = 0.5 + (current_hash[1] as f32 / 255.0) * 0.5;
        Ok(Some(Classification::new(label, confidence)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_classifier_is_deterministic_and_skips_repeats() {
        let mut first = StubClassifier::new();
        let mut second = StubClassifier::new();

        let a = first
            .classify(b"frame1", 2, 1, PixelFormat::Rgb24)
            .unwrap()
            .expect("first frame classified");
        let b = second
            .classify(b"frame1", 2, 1, PixelFormat::Rgb24)
            .unwrap()
            .expect("first frame classified");
        assert_eq!(a, b);
        assert!((0.5..=1.0).contains(&a.confidence));

        let repeat = first.classify(b"frame1", 2, 1, PixelFormat::Rgb24).unwrap();
        assert!(repeat.is_none());

        let changed = first.classify(b"frame2", 2, 1, PixelFormat::Rgb24).unwrap();
        assert!(changed.is_some());
    }
}
