//! liveseg: real-time frame pipeline for live video segmentation.
//!
//! Frames flow from a capture source through the pipeline to a display sink:
//!
//! ```text
//! FrameSource -> CaptureLoop -> Pipeline::on_frame -> (bypass | FilterQueue -> Strategy) -> FrameSink
//! ```
//!
//! # Guarantees
//!
//! 1. **Capture never blocks**: `on_frame` never waits on strategy work.
//! 2. **No backlog**: the filter queue holds at most one job; a frame that
//!    arrives while it is busy is dropped.
//! 3. **In order**: frames reach the sink in arrival order, with gaps.
//! 4. **Clean switches**: once `set_mode` returns, nothing produced by the
//!    previous strategy (frames or labels) is observable.
//!
//! # Module Structure
//!
//! - `frame`: immutable, reference-counted frames
//! - `pipeline`: mode state machine and frame routing
//! - `queue`: single-slot filter queue with generation-gated delivery
//! - `strategy`: ColorMask, Blur, ImageComposite, Detection
//! - `classify`: classifier backends used by Detection
//! - `ingest`, `capture`: frame sources and the delivery thread
//! - `sink`, `ui`: outputs to the display and the UI context

pub mod capture;
pub mod classify;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod strategy;
pub mod ui;

pub use capture::CaptureLoop;
pub use classify::{Classification, Classifier, ClassifierRegistry};
pub use config::SegdConfig;
pub use frame::{Frame, PixelFormat};
pub use ingest::{open_source, FrameSource, SourceStats};
pub use pipeline::{Mode, Pipeline, PipelineState, PipelineStats};
pub use queue::{Epoch, FilterQueue, Job, Submit};
pub use sink::{ChannelSink, FrameSink};
pub use strategy::{
    CompositeReference, DefaultStrategies, Strategy, StrategyContext, StrategyFactory,
    StrategyKind,
};
pub use ui::{UiEvent, UiSender};
