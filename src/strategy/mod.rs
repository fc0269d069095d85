//! Frame strategies.
//!
//! A strategy turns one input frame into zero or one output frame. The
//! pipeline captures the input by value into a filter-queue job, so a strategy
//! never reads a shared "current frame" slot and never sees two frames at once.
//!
//! Outcomes of `process`:
//! - `Ok(Some(frame))`: forward `frame` to the sink.
//! - `Ok(None)`: nothing to show for this input; treated like a dropped frame.
//! - `Err(_)`: logged by the queue and treated like `Ok(None)`.

mod blur;
mod color_mask;
mod composite;
mod detection;

pub use blur::Blur;
pub use color_mask::ColorMask;
pub use composite::{CompositeReference, ImageComposite};
pub use detection::Detection;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::classify::ClassifierRegistry;
use crate::config::StrategySettings;
use crate::frame::Frame;
use crate::queue::Epoch;
use crate::ui::UiSender;

/// The closed set of strategy variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ColorMask,
    Blur,
    ImageComposite,
    Detection,
}

impl StrategyKind {
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::ColorMask => "color_mask",
            StrategyKind::Blur => "blur",
            StrategyKind::ImageComposite => "image_composite",
            StrategyKind::Detection => "detection",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit of frame work run on the filter queue worker.
pub trait Strategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Process one frame. The input must not be kept once this returns,
    /// except by work whose results are gated on the strategy's epoch.
    fn process(&mut self, input: Frame) -> Result<Option<Frame>>;
}

/// What a strategy gets from the pipeline at construction.
#[derive(Clone)]
pub struct StrategyContext {
    /// Generation of the filter queue this strategy runs under. Out-of-band
    /// results must be published through it.
    pub epoch: Epoch,
    pub ui: UiSender,
}

/// Builds strategy instances for `Pipeline::set_mode`.
pub trait StrategyFactory: Send + Sync {
    fn build(&self, kind: StrategyKind, ctx: StrategyContext) -> Result<Box<dyn Strategy>>;

    /// Reference image handle for ImageComposite, if this factory has one.
    fn composite_reference(&self) -> Option<CompositeReference> {
        None
    }
}

/// Factory for the built-in strategies.
pub struct DefaultStrategies {
    settings: StrategySettings,
    reference: CompositeReference,
    classifiers: ClassifierRegistry,
}

impl DefaultStrategies {
    pub fn new(settings: StrategySettings, classifiers: ClassifierRegistry) -> Self {
        Self {
            settings,
            reference: CompositeReference::new(),
            classifiers,
        }
    }

    /// Like `new`, and loads `composite.reference_path` if one is configured.
    pub fn from_settings(settings: StrategySettings, classifiers: ClassifierRegistry) -> Result<Self> {
        let strategies = Self::new(settings, classifiers);
        if let Some(path) = &strategies.settings.composite.reference_path {
            strategies.reference.load(path)?;
        }
        Ok(strategies)
    }

    /// Handle the UI uses to set or clear the composite reference image.
    pub fn reference(&self) -> CompositeReference {
        self.reference.clone()
    }
}

impl StrategyFactory for DefaultStrategies {
    fn build(&self, kind: StrategyKind, ctx: StrategyContext) -> Result<Box<dyn Strategy>> {
        let strategy: Box<dyn Strategy> = match kind {
            StrategyKind::ColorMask => Box::new(ColorMask::new(&self.settings.color_mask)),
            StrategyKind::Blur => Box::new(Blur::new(&self.settings.blur)),
            StrategyKind::ImageComposite => Box::new(ImageComposite::new(
                &self.settings.composite,
                self.reference.clone(),
            )),
            StrategyKind::Detection => {
                let classifier = self
                    .classifiers
                    .default_backend()
                    .ok_or_else(|| anyhow!("no classifier backend registered"))?;
                Box::new(Detection::new(classifier, ctx.epoch, ctx.ui)?)
            }
        };
        Ok(strategy)
    }

    fn composite_reference(&self) -> Option<CompositeReference> {
        Some(self.reference.clone())
    }
}
