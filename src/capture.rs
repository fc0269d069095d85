//! Capture loop: the frame delivery context.
//!
//! One thread owns the frame source, pulls frames at the target rate and hands
//! each one to `Pipeline::on_frame`. The source is opened on that thread, so
//! device handles never cross threads.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::ingest::FrameSource;
use crate::pipeline::Pipeline;

/// How long a source may stay unhealthy before the loop gives up.
pub const UNHEALTHY_GRACE: Duration = Duration::from_secs(10);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to a running capture thread.
pub struct CaptureLoop {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl CaptureLoop {
    /// Open a source with `open` on a new thread, connect it, and start
    /// delivering frames to `pipeline`. Returns once the source is connected.
    ///
    /// `target_fps` of 0 delivers frames as fast as the source produces them.
    pub fn start<F>(open: F, pipeline: Arc<Pipeline>, target_fps: u32) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let thread_stop = Arc::clone(&stop);
        let thread_frames = Arc::clone(&frames);
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let mut source = match open().and_then(|mut source| {
                    source.connect()?;
                    Ok(source)
                }) {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(err) => {
                        let message = format!("{:#}", err);
                        let _ = ready_tx.send(Err(err));
                        return Err(anyhow!(message));
                    }
                };
                run_capture(
                    source.as_mut(),
                    &pipeline,
                    target_fps,
                    &thread_stop,
                    &thread_frames,
                )
            })
            .context("failed to spawn capture thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                frames,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err.context("source unavailable"))
            }
            Err(_) => {
                let _ = handle.join();
                Err(anyhow!("capture thread exited before connecting"))
            }
        }
    }

    /// Frames handed to the pipeline so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// True once the capture thread has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the thread to stop and wait for it. Returns the loop's error, if
    /// it ended on one.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.join() {
            log::warn!("capture loop ended with error: {:#}", err);
        }
    }
}

fn run_capture(
    source: &mut dyn FrameSource,
    pipeline: &Pipeline,
    target_fps: u32,
    stop: &AtomicBool,
    frames: &AtomicU64,
) -> Result<()> {
    let interval = if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(1) / target_fps
    };
    let mut unhealthy_since: Option<Instant> = None;
    let mut last_health_log = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        match source.next_frame() {
            Ok(frame) => {
                unhealthy_since = None;
                pipeline.on_frame(frame);
                frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                log::warn!("capture failed: {:#}", err);
                if source.is_healthy() {
                    unhealthy_since = None;
                } else {
                    let since = *unhealthy_since.get_or_insert(started);
                    if since.elapsed() >= UNHEALTHY_GRACE {
                        let stats = source.stats();
                        return Err(anyhow!(
                            "source {} unhealthy for {:?}; giving up",
                            stats.url,
                            UNHEALTHY_GRACE
                        ));
                    }
                }
                thread::sleep(interval.max(Duration::from_millis(50)));
                continue;
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = source.stats();
            log::debug!(
                "source health={} frames={} url={}",
                source.is_healthy(),
                stats.frames_captured,
                stats.url
            );
            last_health_log = Instant::now();
        }

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    log::info!("capture loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifierRegistry;
    use crate::config::{SourceSettings, StrategySettings};
    use crate::ingest::{open_source, SourceStats};
    use crate::sink::ChannelSink;
    use crate::strategy::DefaultStrategies;
    use crate::ui::UiSender;

    fn pipeline() -> (Arc<Pipeline>, mpsc::Receiver<crate::frame::Frame>) {
        let (sink, frames) = ChannelSink::new();
        let strategies = DefaultStrategies::new(StrategySettings::default(), ClassifierRegistry::new());
        let pipeline =
            Pipeline::new(Arc::new(sink), Arc::new(strategies), UiSender::detached()).unwrap();
        (Arc::new(pipeline), frames)
    }

    #[test]
    fn delivers_frames_in_order_until_stopped() {
        let (pipeline, frames) = pipeline();
        let settings = SourceSettings {
            url: "stub://capture".to_string(),
            width: 16,
            height: 12,
            ..SourceSettings::default()
        };
        let capture = CaptureLoop::start(move || open_source(&settings), pipeline, 0).unwrap();

        let first = frames.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = frames.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(second.sequence() > first.sequence());

        capture.stop().unwrap();
    }

    #[test]
    fn unavailable_source_fails_start() {
        let (pipeline, _frames) = pipeline();
        let settings = SourceSettings {
            url: "rtsp://nowhere".to_string(),
            ..SourceSettings::default()
        };
        let result = CaptureLoop::start(move || open_source(&settings), pipeline, 30);
        assert!(result.is_err());
    }

    struct Broken;

    impl FrameSource for Broken {
        fn connect(&mut self) -> Result<()> {
            Err(anyhow!("device busy"))
        }

        fn next_frame(&mut self) -> Result<crate::frame::Frame> {
            Err(anyhow!("not connected"))
        }

        fn is_healthy(&self) -> bool {
            false
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                url: "broken://".to_string(),
            }
        }
    }

    #[test]
    fn connect_error_is_reported() {
        let (pipeline, _frames) = pipeline();
        let result = CaptureLoop::start(|| Ok(Box::new(Broken) as Box<dyn FrameSource>), pipeline, 30);
        let message = result.err().map(|e| format!("{:#}", e)).unwrap_or_default();
        assert!(message.contains("device busy"), "{}", message);
    }
}
