use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::Classifier;
use super::backends::{CpuClassifier, StubClassifier};
use crate::config::DetectionSettings;

/// A classifier shared between Detection strategy instances.
pub type SharedClassifier = Arc<Mutex<dyn Classifier>>;

/// Thread-safe registry of classifier backends.
///
/// Backends are wrapped in `Mutex` because `Classifier::classify` takes `&mut self`.
pub struct ClassifierRegistry {
    backends: HashMap<String, SharedClassifier>,
    default_name: Option<String>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in `stub` and `cpu` backends and, when
    /// configured and compiled in, the `tract` backend. The configured backend
    /// becomes the default.
    pub fn from_settings(settings: &DetectionSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(StubClassifier::new());
        registry.register(CpuClassifier::new());

        if settings.backend == "tract" {
            #[cfg(feature = "backend-tract")]
            {
                let model_path = settings
                    .model_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
                let labels_path = settings
                    .labels_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("tract backend requires detection.labels_path"))?;
                let mut backend = super::backends::TractClassifier::new(
                    model_path,
                    labels_path,
                    settings.input_width,
                    settings.input_height,
                )?;
                backend.warm_up()?;
                registry.register(backend);
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                return Err(anyhow!("tract backend requires the backend-tract feature"));
            }
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<C: Classifier + 'static>(&mut self, backend: C) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("classifier '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedClassifier> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedClassifier> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
