//! Frame pipeline: source -> (bypass | strategy via filter queue) -> sink.
//!
//! The pipeline is shared between the delivery thread (calling `on_frame`)
//! and the UI thread (calling `set_mode`). The active mode and strategy live
//! behind one `RwLock`:
//! - `on_frame` only ever *tries* to take the read lock. A frame that arrives
//!   while a switch holds the write lock is dropped and counted.
//! - `set_mode` holds the write lock across cancel, drain, release of the old
//!   strategy and construction of the new one, so a frame is either submitted
//!   before the cancel (and its result discarded) or sees the new strategy.
//! - Switches are serialized by a separate mutex. An unchanged mode is
//!   detected under the read lock and never takes the write lock.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use crate::classify::ClassifierRegistry;
use crate::config::SegdConfig;
use crate::frame::Frame;
use crate::queue::{FilterQueue, Job, Submit};
use crate::sink::FrameSink;
use crate::strategy::{
    CompositeReference, DefaultStrategies, Strategy, StrategyContext, StrategyFactory,
    StrategyKind,
};
use crate::ui::UiSender;

/// User-selectable pipeline mode. The index is what the UI sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Bypass,
    ColorMask,
    Blur,
    ImageComposite,
    Detection,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Bypass,
        Mode::ColorMask,
        Mode::Blur,
        Mode::ImageComposite,
        Mode::Detection,
    ];

    pub fn from_index(index: i64) -> Option<Mode> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> u8 {
        match self {
            Mode::Bypass => 0,
            Mode::ColorMask => 1,
            Mode::Blur => 2,
            Mode::ImageComposite => 3,
            Mode::Detection => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Bypass => "bypass",
            Mode::ColorMask => "color_mask",
            Mode::Blur => "blur",
            Mode::ImageComposite => "image_composite",
            Mode::Detection => "detection",
        }
    }

    /// Accepts an index ("2") or a name ("blur", "color-mask", "original").
    pub fn parse(value: &str) -> Result<Mode> {
        let value = value.trim();
        if let Ok(index) = value.parse::<i64>() {
            return Self::from_index(index)
                .ok_or_else(|| anyhow!("mode index {} out of range 0..=4", index));
        }
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "bypass" | "original" | "none" => Ok(Mode::Bypass),
            "color_mask" | "color" | "colormask" => Ok(Mode::ColorMask),
            "blur" => Ok(Mode::Blur),
            "image_composite" | "image" | "composite" => Ok(Mode::ImageComposite),
            "detection" | "detect" => Ok(Mode::Detection),
            other => Err(anyhow!("unknown mode '{}'", other)),
        }
    }

    /// Strategy backing this mode; `None` for bypass.
    pub fn strategy_kind(self) -> Option<StrategyKind> {
        match self {
            Mode::Bypass => None,
            Mode::ColorMask => Some(StrategyKind::ColorMask),
            Mode::Blur => Some(StrategyKind::Blur),
            Mode::ImageComposite => Some(StrategyKind::ImageComposite),
            Mode::Detection => Some(StrategyKind::Detection),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Bypass,
    Filtering(StrategyKind),
}

/// Pipeline counters. Queue outcomes are folded in from the filter queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub bypassed: u64,
    pub submitted: u64,
    pub dropped_busy: u64,
    pub dropped_switching: u64,
    pub delivered: u64,
    pub no_output: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct PipelineCounters {
    received: AtomicU64,
    bypassed: AtomicU64,
    dropped_switching: AtomicU64,
}

type SharedStrategy = Arc<Mutex<Box<dyn Strategy>>>;

struct Active {
    mode: Mode,
    strategy: Option<SharedStrategy>,
}

impl Active {
    fn bypass() -> Self {
        Self {
            mode: Mode::Bypass,
            strategy: None,
        }
    }
}

pub struct Pipeline {
    active: RwLock<Active>,
    switching: Mutex<()>,
    queue: FilterQueue,
    sink: Arc<dyn FrameSink>,
    factory: Arc<dyn StrategyFactory>,
    ui: UiSender,
    counters: PipelineCounters,
}

impl Pipeline {
    /// Create a pipeline in bypass mode.
    pub fn new(
        sink: Arc<dyn FrameSink>,
        factory: Arc<dyn StrategyFactory>,
        ui: UiSender,
    ) -> Result<Self> {
        Ok(Self {
            active: RwLock::new(Active::bypass()),
            switching: Mutex::new(()),
            queue: FilterQueue::new(Arc::clone(&sink))?,
            sink,
            factory,
            ui,
            counters: PipelineCounters::default(),
        })
    }

    /// Build the default strategies and classifiers from `config`, then
    /// switch to the configured initial mode.
    pub fn from_config(config: &SegdConfig, sink: Arc<dyn FrameSink>, ui: UiSender) -> Result<Self> {
        let classifiers = ClassifierRegistry::from_settings(&config.strategies.detection)?;
        let strategies = DefaultStrategies::from_settings(config.strategies.clone(), classifiers)?;
        let pipeline = Self::new(sink, Arc::new(strategies), ui)?;
        pipeline.set_mode(config.initial_mode);
        Ok(pipeline)
    }

    /// Switch modes. Returns once nothing from the previous strategy can reach
    /// the sink or the UI. Unchanged mode is a no-op.
    pub fn set_mode(&self, mode: Mode) {
        let _switching = self.switching.lock().unwrap_or_else(PoisonError::into_inner);
        let from = self.mode();
        if from == mode {
            log::debug!("mode {} already active", mode);
            return;
        }

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);

        self.queue.cancel_and_drain();
        // The worker has let go of its strategy handle, so this is the last one.
        active.strategy = None;
        *active = self.activate(mode);
        let landed = active.mode;
        drop(active);

        log::info!("pipeline mode {} -> {}", from, landed);
        if landed != from {
            self.ui.mode_changed(landed);
        }
    }

    /// UI-facing form of `set_mode`. Out-of-range indices are ignored.
    pub fn set_mode_index(&self, index: i64) {
        match Mode::from_index(index) {
            Some(mode) => self.set_mode(mode),
            None => log::warn!("ignoring invalid mode index {}", index),
        }
    }

    /// Accept one frame from the delivery thread. Never waits on strategy work.
    pub fn on_frame(&self, frame: Frame) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let active = match self.active.try_read() {
            Ok(active) => active,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.counters
                    .dropped_switching
                    .fetch_add(1, Ordering::Relaxed);
                log::trace!("mode switch in progress; dropping frame {}", frame.sequence());
                return;
            }
        };

        let Some(strategy) = active.strategy.clone() else {
            drop(active);
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            self.sink.display(frame);
            return;
        };

        // Submitted under the read lock so a concurrent switch cancels it.
        let job = Job::new(frame.sequence(), move || {
            let mut strategy = strategy
                .lock()
                .map_err(|_| anyhow!("strategy lock poisoned"))?;
            strategy.process(frame)
        });
        if self.queue.submit(job) == Submit::Dropped {
            log::trace!("filter queue busy; frame dropped");
        }
        drop(active);
    }

    pub fn mode(&self) -> Mode {
        self.read_active().mode
    }

    pub fn state(&self) -> PipelineState {
        match self.mode().strategy_kind() {
            Some(kind) => PipelineState::Filtering(kind),
            None => PipelineState::Bypass,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let queue = self.queue.stats();
        PipelineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            submitted: queue.accepted,
            dropped_busy: queue.dropped,
            dropped_switching: self.counters.dropped_switching.load(Ordering::Relaxed),
            delivered: queue.delivered,
            no_output: queue.no_output,
            failed: queue.failed,
            abandoned: queue.abandoned,
        }
    }

    /// Wait up to `timeout` for in-flight strategy work to finish.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    /// Handle for setting the ImageComposite reference image.
    pub fn composite_reference(&self) -> Option<CompositeReference> {
        self.factory.composite_reference()
    }

    fn activate(&self, mode: Mode) -> Active {
        let Some(kind) = mode.strategy_kind() else {
            return Active::bypass();
        };
        let ctx = StrategyContext {
            epoch: self.queue.epoch(),
            ui: self.ui.clone(),
        };
        match self.factory.build(kind, ctx) {
            Ok(strategy) => Active {
                mode,
                strategy: Some(Arc::new(Mutex::new(strategy))),
            },
            Err(e) => {
                log::warn!("failed to build {} strategy, staying in bypass: {:#}", kind, e);
                Active::bypass()
            }
        }
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, Active> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
