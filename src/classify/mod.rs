//! Frame classification backends used by the Detection strategy.
//!
//! A classifier receives a borrowed pixel slice and returns at most one
//! `(label, confidence)` pair. Backends are shared through a registry so a
//! loaded model survives mode switches.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::Classifier;
#[cfg(feature = "backend-tract")]
pub use backends::TractClassifier;
pub use backends::{CpuClassifier, StubClassifier};
pub use registry::{ClassifierRegistry, SharedClassifier};
pub use result::Classification;
