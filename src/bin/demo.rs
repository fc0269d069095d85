//! demo - scripted synthetic run through every pipeline mode

use anyhow::{anyhow, Result};
use clap::Parser;
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveseg::config::SourceSettings;
use liveseg::ingest::SyntheticSource;
use liveseg::{
    ui, CaptureLoop, ClassifierRegistry, DefaultStrategies, Frame, FrameSink, FrameSource, Mode,
    Pipeline, PipelineStats, SegdConfig, Strategy, StrategyContext, StrategyFactory, StrategyKind,
    UiEvent,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds to spend in each mode.
    #[arg(long, default_value_t = 2)]
    seconds: u64,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Extra processing time per filtered frame, in milliseconds.
    #[arg(long, default_value_t = 0)]
    process_ms: u64,
    /// Synthetic frame width.
    #[arg(long, default_value_t = 320)]
    width: u32,
    /// Synthetic frame height.
    #[arg(long, default_value_t = 240)]
    height: u32,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ModeReport {
    mode: Mode,
    received: u64,
    displayed: u64,
    dropped_busy: u64,
    dropped_switching: u64,
    no_output: u64,
    abandoned: u64,
    labels: u64,
    out_of_order: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    stage("build pipeline");
    let cfg = SegdConfig::default();
    let classifiers = ClassifierRegistry::from_settings(&cfg.strategies.detection)?;
    let strategies = DefaultStrategies::new(cfg.strategies.clone(), classifiers);
    let reference = strategies.reference();
    reference.set_image(backdrop(args.width, args.height))?;
    let factory = Slowed {
        inner: strategies,
        delay: Duration::from_millis(args.process_ms),
    };

    let sink = Arc::new(CountingSink::default());
    let (ui_tx, ui_rx) = ui::channel();
    let pipeline = Arc::new(Pipeline::new(sink.clone(), Arc::new(factory), ui_tx)?);

    let settings = SourceSettings {
        url: "stub://demo".to_string(),
        target_fps: args.fps,
        width: args.width,
        height: args.height,
        ..SourceSettings::default()
    };
    let capture = CaptureLoop::start(
        move || Ok(Box::new(SyntheticSource::new(settings)) as Box<dyn FrameSource>),
        Arc::clone(&pipeline),
        args.fps,
    )?;

    let mut reports = Vec::new();
    for mode in Mode::ALL {
        stage(&format!("mode {} for {}s", mode, args.seconds));
        let before = pipeline.stats();
        let displayed_before = sink.displayed();
        let disorder_before = sink.out_of_order();
        pipeline.set_mode(mode);
        std::thread::sleep(Duration::from_secs(args.seconds));
        let labels = ui_rx
            .try_iter()
            .filter(|event| matches!(event, UiEvent::Label(_)))
            .count() as u64;
        reports.push(report(
            mode,
            &before,
            &pipeline.stats(),
            sink.displayed() - displayed_before,
            sink.out_of_order() - disorder_before,
            labels,
        ));
    }

    capture.stop()?;
    pipeline.set_mode(Mode::Bypass);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("demo summary:");
        for r in &reports {
            println!(
                "  {:<16} received={:<5} displayed={:<5} dropped_busy={:<5} dropped_switching={:<3} no_output={:<3} labels={}",
                r.mode.name(),
                r.received,
                r.displayed,
                r.dropped_busy,
                r.dropped_switching,
                r.no_output,
                r.labels
            );
        }
    }

    let disorder: u64 = reports.iter().map(|r| r.out_of_order).sum();
    if disorder > 0 {
        return Err(anyhow!("{} frames displayed out of order", disorder));
    }
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}

fn report(
    mode: Mode,
    before: &PipelineStats,
    after: &PipelineStats,
    displayed: u64,
    out_of_order: u64,
    labels: u64,
) -> ModeReport {
    ModeReport {
        mode,
        received: after.received - before.received,
        displayed,
        dropped_busy: after.dropped_busy - before.dropped_busy,
        dropped_switching: after.dropped_switching - before.dropped_switching,
        no_output: after.no_output + after.failed - before.no_output - before.failed,
        abandoned: after.abandoned - before.abandoned,
        labels,
        out_of_order,
    }
}

/// Checkerboard backdrop for the composite mode.
fn backdrop(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width.max(1), height.max(1), |x, y| {
        if (x / 16 + y / 16) % 2 == 0 {
            Rgb([230, 200, 40])
        } else {
            Rgb([40, 40, 160])
        }
    })
}

#[derive(Default)]
struct CountingSink {
    displayed: AtomicU64,
    out_of_order: AtomicU64,
    last_sequence: Mutex<u64>,
}

impl CountingSink {
    fn displayed(&self) -> u64 {
        self.displayed.load(Ordering::Relaxed)
    }

    fn out_of_order(&self) -> u64 {
        self.out_of_order.load(Ordering::Relaxed)
    }
}

impl FrameSink for CountingSink {
    fn display(&self, frame: Frame) {
        self.displayed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_sequence.lock() {
            if frame.sequence() <= *last {
                self.out_of_order.fetch_add(1, Ordering::Relaxed);
            }
            *last = frame.sequence();
        }
    }
}

/// Wraps the built-in strategies with a fixed extra processing delay.
struct Slowed {
    inner: DefaultStrategies,
    delay: Duration,
}

struct SlowStrategy {
    inner: Box<dyn Strategy>,
    delay: Duration,
}

impl StrategyFactory for Slowed {
    fn build(&self, kind: StrategyKind, ctx: StrategyContext) -> Result<Box<dyn Strategy>> {
        let inner = self.inner.build(kind, ctx)?;
        if self.delay.is_zero() {
            return Ok(inner);
        }
        Ok(Box::new(SlowStrategy {
            inner,
            delay: self.delay,
        }))
    }

    fn composite_reference(&self) -> Option<liveseg::CompositeReference> {
        self.inner.composite_reference()
    }
}

impl Strategy for SlowStrategy {
    fn kind(&self) -> StrategyKind {
        self.inner.kind()
    }

    fn process(&mut self, input: Frame) -> Result<Option<Frame>> {
        std::thread::sleep(self.delay);
        self.inner.process(input)
    }
}
