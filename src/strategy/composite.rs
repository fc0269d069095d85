use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;
use std::sync::{Arc, RwLock};

use super::{Strategy, StrategyKind};
use crate::config::CompositeSettings;
use crate::frame::Frame;

/// Shared handle to the ImageComposite reference image.
///
/// Cloning the handle shares the slot. The UI may set or clear the reference
/// while a composite strategy is live; the change applies from the next frame
/// the strategy processes.
#[derive(Clone, Default)]
pub struct CompositeReference {
    slot: Arc<RwLock<Option<Arc<RgbImage>>>>,
}

impl CompositeReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image(&self, image: RgbImage) -> Result<()> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("reference image is empty"));
        }
        self.store(Some(Arc::new(image)))
    }

    /// Use a captured frame as the reference.
    pub fn set_frame(&self, frame: &Frame) -> Result<()> {
        self.set_image(frame.to_rgb_image()?)
    }

    /// Decode an image file and use it as the reference.
    pub fn load(&self, path: &Path) -> Result<()> {
        let image = image::open(path)
            .with_context(|| format!("failed to load reference image {}", path.display()))?
            .to_rgb8();
        self.set_image(image)?;
        log::info!("composite reference loaded from {}", path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.store(None)
    }

    pub fn is_set(&self) -> bool {
        self.current().is_some()
    }

    pub(crate) fn current(&self) -> Option<Arc<RgbImage>> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, value: Option<Arc<RgbImage>>) -> Result<()> {
        let mut guard = self
            .slot
            .write()
            .map_err(|_| anyhow!("composite reference lock poisoned"))?;
        *guard = value;
        Ok(())
    }
}

/// Colour-keyed composite over a reference image.
///
/// Pixels whose summed channel distance to the key colour is within half the
/// tolerance are replaced outright; up to the full tolerance they are blended
/// linearly, which softens the matte edge.
pub struct ImageComposite {
    key: [u8; 3],
    tolerance: u32,
    reference: CompositeReference,
    resized: Option<ResizedReference>,
}

struct ResizedReference {
    source: Arc<RgbImage>,
    image: RgbImage,
}

impl ImageComposite {
    pub fn new(settings: &CompositeSettings, reference: CompositeReference) -> Self {
        Self {
            key: settings.key_color,
            tolerance: settings.tolerance as u32,
            reference,
            resized: None,
        }
    }

    fn reference_for(&mut self, source: Arc<RgbImage>, width: u32, height: u32) -> &RgbImage {
        let stale = match &self.resized {
            Some(cached) => {
                !Arc::ptr_eq(&cached.source, &source) || cached.image.dimensions() != (width, height)
            }
            None => true,
        };
        if stale {
            self.resized = None;
        }
        let cached = self.resized.get_or_insert_with(|| {
            let image = if source.dimensions() == (width, height) {
                (*source).clone()
            } else {
                log::debug!(
                    "composite reference resized {}x{} -> {}x{}",
                    source.width(),
                    source.height(),
                    width,
                    height
                );
                imageops::resize(&*source, width, height, FilterType::Triangle)
            };
            ResizedReference { source, image }
        });
        &cached.image
    }
}

impl Strategy for ImageComposite {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ImageComposite
    }

    fn process(&mut self, input: Frame) -> Result<Option<Frame>> {
        let Some(source) = self.reference.current() else {
            self.resized = None;
            return Ok(Some(input));
        };
        let key = self.key;
        let tolerance = self.tolerance;
        let format = input.format();
        let offsets = format.rgb_offsets();
        let reference = self.reference_for(source, input.width(), input.height());
        let backdrop = reference.as_raw();

        let mut output = input.pixels().to_vec();
        for (index, pixel) in output
            .chunks_exact_mut(format.bytes_per_pixel())
            .enumerate()
        {
            let distance: u32 = offsets
                .iter()
                .zip(key.iter())
                .map(|(offset, k)| (pixel[*offset] as i32 - *k as i32).unsigned_abs())
                .sum();
            let weight = key_weight(distance, tolerance);
            if weight == 0 {
                continue;
            }
            let back = &backdrop[index * 3..index * 3 + 3];
            for (channel, offset) in offsets.iter().enumerate() {
                let front = pixel[*offset] as u32;
                let behind = back[channel] as u32;
                pixel[*offset] = ((behind * weight + front * (256 - weight) + 128) / 256) as u8;
            }
        }
        Frame::derive(&input, output).map(Some)
    }
}

/// Replacement weight in 0..=256 for a pixel at `distance` from the key.
fn key_weight(distance: u32, tolerance: u32) -> u32 {
    let inner = tolerance / 2;
    if distance <= inner {
        256
    } else if distance > tolerance {
        0
    } else {
        (tolerance - distance) * 256 / (tolerance - inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use image::Rgb;

    fn settings() -> CompositeSettings {
        CompositeSettings {
            reference_path: None,
            key_color: [0, 255, 0],
            tolerance: 60,
        }
    }

    #[test]
    fn no_reference_passes_input_through() {
        let input = Frame::new(vec![0, 255, 0, 9, 9, 9], 2, 1, PixelFormat::Rgb24, 3).unwrap();
        let mut strategy = ImageComposite::new(&settings(), CompositeReference::new());
        let output = strategy.process(input.clone()).unwrap().unwrap();
        assert_eq!(output, input);
        assert!(output.shares_pixels_with(&input));
    }

    #[test]
    fn key_pixels_take_reference_colour() {
        let reference = CompositeReference::new();
        reference
            .set_image(RgbImage::from_pixel(2, 1, Rgb([200, 10, 50])))
            .unwrap();
        // Green key pixel then a grey pixel far from the key.
        let input = Frame::new(vec![0, 255, 0, 255, 128, 128, 128, 255], 2, 1, PixelFormat::Bgra32, 0)
            .unwrap();
        let mut strategy = ImageComposite::new(&settings(), reference);
        let output = strategy.process(input).unwrap().unwrap();
        // BGRA order.
        assert_eq!(&output.pixels()[..4], &[50, 10, 200, 255]);
        assert_eq!(&output.pixels()[4..], &[128, 128, 128, 255]);
    }

    #[test]
    fn clearing_reference_restores_pass_through() {
        let reference = CompositeReference::new();
        reference
            .set_image(RgbImage::from_pixel(1, 1, Rgb([1, 2, 3])))
            .unwrap();
        let mut strategy = ImageComposite::new(&settings(), reference.clone());
        let input = Frame::new(vec![0, 255, 0], 1, 1, PixelFormat::Rgb24, 0).unwrap();
        assert_eq!(
            strategy.process(input.clone()).unwrap().unwrap().pixels(),
            &[1, 2, 3]
        );

        reference.clear().unwrap();
        assert!(!reference.is_set());
        let output = strategy.process(input.clone()).unwrap().unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn reference_is_resized_to_frame() {
        let reference = CompositeReference::new();
        reference
            .set_image(RgbImage::from_pixel(8, 6, Rgb([40, 80, 120])))
            .unwrap();
        let input = Frame::new(vec![0, 255, 0, 0, 255, 0], 2, 1, PixelFormat::Rgb24, 0).unwrap();
        let mut strategy = ImageComposite::new(&settings(), reference);
        let output = strategy.process(input).unwrap().unwrap();
        for (value, expected) in output.pixels().iter().zip([40u8, 80, 120, 40, 80, 120]) {
            assert!((*value as i32 - expected as i32).abs() <= 1);
        }
    }

    #[test]
    fn reference_can_come_from_a_frame() {
        let reference = CompositeReference::new();
        let shot = Frame::new(vec![10, 20, 30], 1, 1, PixelFormat::Rgb24, 0).unwrap();
        reference.set_frame(&shot).unwrap();
        assert!(reference.is_set());
        assert!(reference.set_image(RgbImage::new(0, 0)).is_err());
    }

    #[test]
    fn missing_reference_file_is_an_error() {
        let reference = CompositeReference::new();
        assert!(reference.load(Path::new("/nonexistent/reference.png")).is_err());
        assert!(!reference.is_set());
    }

    #[test]
    fn key_weight_blends_near_edge() {
        assert_eq!(key_weight(0, 60), 256);
        assert_eq!(key_weight(30, 60), 256);
        assert_eq!(key_weight(45, 60), 128);
        assert_eq!(key_weight(61, 60), 0);
        assert_eq!(key_weight(0, 0), 256);
        assert_eq!(key_weight(1, 0), 0);
    }
}
