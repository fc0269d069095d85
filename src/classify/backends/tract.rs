#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::classify::backend::Classifier;
use crate::classify::result::Classification;
use crate::frame::{rgb_image, PixelFormat};

/// Tract-based ONNX image classifier.
///
/// Loads a local model and a newline-separated labels file. Frames are resized
/// to the model input, normalised to `0.0..=1.0` and fed as NCHW RGB. The top
/// softmax score above the threshold becomes the published label.
pub struct TractClassifier {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    labels: Vec<String>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractClassifier {
    /// Load an ONNX model and its labels from disk.
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: L,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let labels_path = labels_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let labels = std::fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read labels from {}", labels_path.display()))?
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if labels.is_empty() {
            return Err(anyhow!("labels file {} is empty", labels_path.display()));
        }

        Ok(Self {
            model,
            labels,
            width,
            height,
            confidence_threshold: 0.1,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Tensor> {
        let source = rgb_image(pixels, width, height, format)?;
        let resized = image::imageops::resize(&source, self.width, self.height, FilterType::Triangle);

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );

        Ok(input.into_tensor())
    }

    fn top_label(&self, outputs: TVec<TValue>) -> Result<Option<Classification>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let max_logit = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if !max_logit.is_finite() {
            return Ok(None);
        }
        let exp_sum: f32 = scores.iter().map(|s| (s - max_logit).exp()).sum();

        let Some((index, best)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return Ok(None);
        };
        let confidence = (best - max_logit).exp() / exp_sum;
        if confidence < self.confidence_threshold {
            return Ok(None);
        }

        let label = self
            .labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class {}", index));
        Ok(Some(Classification::new(label, confidence)))
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Option<Classification>> {
        let input = self.build_input(pixels, width, height, format)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.top_label(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let len = PixelFormat::Rgb24.buffer_len(self.width, self.height)?;
        let blank = vec![0u8; len];
        self.classify(&blank, self.width, self.height, PixelFormat::Rgb24)
            .map(|_| ())
    }
}
