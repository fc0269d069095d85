//! segd - live segmentation preview daemon
//!
//! This daemon:
//! 1. Opens the configured frame source (stub:// or V4L2)
//! 2. Routes frames through the pipeline in the configured mode
//! 3. Reports display frame rate and latency from the sink
//! 4. Reads control commands from stdin (the UI context):
//!    `0`-`4` or a mode name, `ref <path>`, `ref clear`, `stats`, `quit`
//! 5. Prints mode changes and detection labels as they arrive

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use liveseg::{
    open_source, ui, CaptureLoop, Frame, FrameSink, Mode, Pipeline, SegdConfig, UiEvent,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file (overrides LIVESEG_CONFIG).
    #[arg(long, env = "LIVESEG_CONFIG")]
    config: Option<PathBuf>,
    /// Initial mode, by index (0-4) or name.
    #[arg(long)]
    mode: Option<String>,
    /// Print UI events as JSON lines on stdout.
    #[arg(long)]
    json: bool,
    /// Seconds between display rate reports.
    #[arg(long, default_value_t = 5)]
    report_secs: u64,
}

enum Control {
    Shutdown,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = SegdConfig::load_from(args.config.as_deref())?;
    if let Some(mode) = &args.mode {
        cfg.initial_mode = Mode::parse(mode)?;
    }

    let (ui_tx, ui_rx) = ui::channel();
    let json = args.json;
    std::thread::Builder::new()
        .name("ui".to_string())
        .spawn(move || {
            for event in ui_rx {
                print_event(&event, json);
            }
        })
        .context("failed to spawn ui thread")?;

    let sink = Arc::new(RateSink::new(Duration::from_secs(args.report_secs.max(1))));
    let pipeline = Arc::new(Pipeline::from_config(&cfg, sink, ui_tx)?);

    let source_settings = cfg.source.clone();
    let capture = CaptureLoop::start(
        move || open_source(&source_settings),
        Arc::clone(&pipeline),
        cfg.source.target_fps,
    )?;

    log::info!(
        "segd running. source={} {}x{} @ {} fps, mode={}",
        cfg.source.url,
        cfg.source.width,
        cfg.source.height,
        cfg.source.target_fps,
        pipeline.mode()
    );

    let (control_tx, control_rx) = mpsc::channel();
    let ctrlc_tx = control_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Control::Shutdown);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let console_pipeline = Arc::clone(&pipeline);
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if !handle_command(&console_pipeline, line.trim()) {
                    break;
                }
            }
            let _ = control_tx.send(Control::Shutdown);
        })
        .context("failed to spawn console thread")?;

    log::info!("segd waiting for commands (Ctrl-C to stop)...");
    loop {
        match control_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Control::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if capture.is_finished() {
                    log::error!("capture loop exited");
                    break;
                }
            }
        }
    }

    log::info!("shutdown requested, stopping capture...");
    let result = capture.stop();
    pipeline.set_mode(Mode::Bypass);
    log::info!("final stats: {:?}", pipeline.stats());
    result
}

/// Returns false when the console should stop reading.
fn handle_command(pipeline: &Pipeline, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).unwrap_or_default();
    match command {
        "" => {}
        "quit" | "exit" => return false,
        "stats" => match serde_json::to_string(&pipeline.stats()) {
            Ok(stats) => println!("{}", stats),
            Err(e) => log::warn!("failed to encode stats: {}", e),
        },
        "ref" => {
            let Some(reference) = pipeline.composite_reference() else {
                log::warn!("composite reference not available");
                return true;
            };
            let result = match rest {
                "" => Err(anyhow!("usage: ref <path> | ref clear")),
                "clear" => reference.clear(),
                path => reference.load(std::path::Path::new(path)),
            };
            if let Err(e) = result {
                log::warn!("reference update failed: {:#}", e);
            }
        }
        _ => match command.parse::<i64>() {
            Ok(index) => pipeline.set_mode_index(index),
            Err(_) => match Mode::parse(command) {
                Ok(mode) => pipeline.set_mode(mode),
                Err(e) => log::warn!("{}", e),
            },
        },
    }
    true
}

fn print_event(event: &UiEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("failed to encode ui event: {}", e),
        }
        return;
    }
    match event {
        UiEvent::ModeChanged { mode } => log::info!("mode: {} ({})", mode, mode.index()),
        UiEvent::Label(classification) => log::info!("label: {}", classification),
    }
}

/// Display stand-in: counts frames and reports rate and capture-to-display
/// latency at a fixed interval.
struct RateSink {
    interval: Duration,
    frames: AtomicU64,
    window: Mutex<Window>,
}

struct Window {
    started: Instant,
    frames: u64,
    latency_total: Duration,
    last_sequence: u64,
}

impl RateSink {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            frames: AtomicU64::new(0),
            window: Mutex::new(Window {
                started: Instant::now(),
                frames: 0,
                latency_total: Duration::ZERO,
                last_sequence: 0,
            }),
        }
    }
}

impl FrameSink for RateSink {
    fn display(&self, frame: Frame) {
        let total = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        if frame.sequence() <= window.last_sequence {
            log::warn!(
                "frame {} displayed after frame {}",
                frame.sequence(),
                window.last_sequence
            );
        }
        window.last_sequence = frame.sequence();
        window.frames += 1;
        window.latency_total += frame.age();

        let elapsed = window.started.elapsed();
        if elapsed >= self.interval {
            let fps = window.frames as f64 / elapsed.as_secs_f64();
            let latency = window.latency_total / window.frames.max(1) as u32;
            log::info!(
                "display: {:.1} fps, avg latency {:?}, frames={} last_seq={}",
                fps,
                latency,
                total,
                window.last_sequence
            );
            window.started = Instant::now();
            window.frames = 0;
            window.latency_total = Duration::ZERO;
        }
    }
}
