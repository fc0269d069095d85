//! Single-slot filter queue.
//!
//! The queue owns one worker thread and at most one job at a time:
//! - `submit` starts a job if the worker is idle and drops it otherwise. The
//!   newest frame is discarded rather than queued, so a slow strategy never
//!   builds up latency.
//! - Every job is stamped with the queue generation at submission. Its result
//!   is delivered to the sink only if the generation is still current when the
//!   job finishes. The sink is called outside the queue lock, so `submit`
//!   never waits on a slow display.
//! - `cancel` bumps the generation, so the result of the executing job is
//!   abandoned. `drain` waits until the worker is idle again, which includes
//!   any delivery that passed the generation check before the cancel.
//!
//! `Epoch` exposes the generation check to work that completes outside the
//! queue (Detection labels), so it can be abandoned by the same `cancel`.

use anyhow::{Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::Frame;
use crate::sink::FrameSink;

type JobFn = Box<dyn FnOnce() -> Result<Option<Frame>> + Send>;

/// One unit of strategy work. The input frame is captured by the closure.
pub struct Job {
    sequence: u64,
    run: JobFn,
}

impl Job {
    pub fn new<F>(sequence: u64, run: F) -> Self
    where
        F: FnOnce() -> Result<Option<Frame>> + Send + 'static,
    {
        Self {
            sequence,
            run: Box::new(run),
        }
    }
}

/// Outcome of `FilterQueue::submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    /// The worker was busy (or shutting down); the job was discarded.
    Dropped,
}

/// Counters for jobs seen by a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub no_output: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct QueueCounters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    no_output: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

struct Pending {
    generation: u64,
    job: Job,
}

struct Slot {
    pending: Option<Pending>,
    /// True from acceptance until the job's outcome has been handled.
    busy: bool,
    generation: u64,
    shutdown: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    work_ready: Condvar,
    idle: Condvar,
    sink: Arc<dyn FrameSink>,
    counters: QueueCounters,
}

impl Shared {
    // Slot updates are single assignments, so a poisoned lock still holds a
    // consistent slot.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Execution queue with capacity one and drop-on-busy backpressure.
pub struct FilterQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FilterQueue {
    /// Spawn the worker thread. Results are delivered to `sink`.
    pub fn new(sink: Arc<dyn FrameSink>) -> Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                pending: None,
                busy: false,
                generation: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            sink,
            counters: QueueCounters::default(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("filter-queue".to_string())
            .spawn(move || run_worker(worker_shared))
            .context("spawn filter queue worker")?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Start `job` if the worker is idle, otherwise drop it. Never blocks on
    /// the executing job.
    pub fn submit(&self, job: Job) -> Submit {
        let mut slot = self.shared.lock();
        if slot.shutdown || slot.busy {
            drop(slot);
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("filter busy; dropping frame {}", job.sequence);
            return Submit::Dropped;
        }
        slot.busy = true;
        slot.pending = Some(Pending {
            generation: slot.generation,
            job,
        });
        drop(slot);

        self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.shared.work_ready.notify_one();
        Submit::Accepted
    }

    /// Abandon the current job's result and discard any job not yet started.
    ///
    /// A completion after this call is discarded. Does not wait for the job,
    /// nor for a delivery that already passed its generation check; use
    /// `drain` for that.
    pub fn cancel(&self) {
        let mut slot = self.shared.lock();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(pending) = slot.pending.take() {
            slot.busy = false;
            self.shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            log::debug!("abandoned frame {} before it started", pending.job.sequence);
        }
        drop(slot);
        self.shared.idle.notify_all();
    }

    /// Block until the worker has finished whatever it is executing.
    pub fn drain(&self) {
        let slot = self.shared.lock();
        let _slot = self
            .shared
            .idle
            .wait_while(slot, |slot| slot.busy)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Abandon in-flight work and wait until the queue can be reused.
    pub fn cancel_and_drain(&self) {
        self.cancel();
        self.drain();
    }

    /// Wait up to `timeout` for the worker to become idle. Returns true if idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let slot = self.shared.lock();
        let (slot, _) = self
            .shared
            .idle
            .wait_timeout_while(slot, timeout, |slot| slot.busy)
            .unwrap_or_else(PoisonError::into_inner);
        !slot.busy
    }

    /// Handle bound to the current generation.
    pub fn epoch(&self) -> Epoch {
        Epoch {
            shared: Arc::clone(&self.shared),
            generation: self.shared.lock().generation,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            no_output: c.no_output.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, abandon in-flight results and join the worker.
    pub fn shutdown(&mut self) {
        {
            let mut slot = self.shared.lock();
            slot.shutdown = true;
            slot.generation = slot.generation.wrapping_add(1);
            if slot.pending.take().is_some() {
                slot.busy = false;
            }
        }
        self.shared.work_ready.notify_all();
        self.shared.idle.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("filter queue worker panicked");
            }
        }
    }
}

impl Drop for FilterQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Generation snapshot used to gate out-of-band results.
#[derive(Clone)]
pub struct Epoch {
    shared: Arc<Shared>,
    generation: u64,
}

impl Epoch {
    pub fn is_current(&self) -> bool {
        self.shared.lock().generation == self.generation
    }

    /// Run `publish` under the queue lock if this epoch has not been
    /// cancelled. A concurrent `cancel` either happens before (and `publish`
    /// is skipped) or waits until `publish` returns.
    ///
    /// `submit` contends for the same lock, so `publish` must not block; a
    /// send on an unbounded channel is fine.
    pub fn run_if_current<R>(&self, publish: impl FnOnce() -> R) -> Option<R> {
        let slot = self.shared.lock();
        if slot.generation != self.generation {
            return None;
        }
        let result = publish();
        drop(slot);
        Some(result)
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let pending = {
            let mut slot = shared.lock();
            loop {
                if let Some(pending) = slot.pending.take() {
                    break pending;
                }
                if slot.shutdown {
                    return;
                }
                slot = shared
                    .work_ready
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Pending { generation, job } = pending;
        let sequence = job.sequence;
        let outcome = panic::catch_unwind(AssertUnwindSafe(job.run));

        // Busy stays set until after delivery, so `drain` covers the display.
        let current = shared.lock().generation == generation;
        if !current {
            shared.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            log::debug!("discarding result for frame {} after cancel", sequence);
        } else {
            match outcome {
                Ok(Ok(Some(frame))) => {
                    let sink = Arc::clone(&shared.sink);
                    if panic::catch_unwind(AssertUnwindSafe(|| sink.display(frame))).is_err() {
                        log::error!("sink panicked while displaying frame {}", sequence);
                    }
                    shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Ok(None)) => {
                    shared.counters.no_output.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("strategy failed on frame {}: {:#}", sequence, err);
                }
                Err(_) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!("strategy panicked on frame {}", sequence);
                }
            }
        }
        shared.lock().busy = false;
        shared.idle.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::sink::ChannelSink;
    use anyhow::anyhow;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![sequence as u8; 3], 1, 1, PixelFormat::Rgb24, sequence).unwrap()
    }

    fn queue() -> (FilterQueue, mpsc::Receiver<Frame>) {
        let (sink, rx) = ChannelSink::new();
        (FilterQueue::new(Arc::new(sink)).unwrap(), rx)
    }

    /// Job that waits for a release signal before returning its frame.
    fn gated(sequence: u64) -> (Job, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let job = Job::new(sequence, move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(Some(frame(sequence)))
        });
        (job, release_tx, started_rx)
    }

    #[test]
    fn idle_queue_executes_and_delivers() {
        let (queue, rx) = queue();
        assert_eq!(
            queue.submit(Job::new(1, || Ok(Some(frame(1))))),
            Submit::Accepted
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap().sequence(), 1);
        assert!(queue.wait_idle(WAIT));
        assert_eq!(queue.stats().delivered, 1);
    }

    #[test]
    fn busy_queue_drops_newest_and_keeps_running_job() {
        let (queue, rx) = queue();
        let (job, release, started) = gated(1);
        assert_eq!(queue.submit(job), Submit::Accepted);
        started.recv_timeout(WAIT).unwrap();

        assert_eq!(
            queue.submit(Job::new(2, || Ok(Some(frame(2))))),
            Submit::Dropped
        );

        release.send(()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().sequence(), 1);
        assert!(queue.wait_idle(WAIT));
        assert!(rx.try_recv().is_err());

        let stats = queue.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn cancel_abandons_result_of_executing_job() {
        let (queue, rx) = queue();
        let (job, release, started) = gated(7);
        queue.submit(job);
        started.recv_timeout(WAIT).unwrap();

        queue.cancel();
        release.send(()).unwrap();
        queue.drain();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(queue.stats().abandoned, 1);

        // Reusable after drain.
        assert_eq!(
            queue.submit(Job::new(8, || Ok(Some(frame(8))))),
            Submit::Accepted
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap().sequence(), 8);
    }

    #[test]
    fn submit_returns_while_sink_is_displaying() {
        let (displaying_tx, displaying_rx) = mpsc::channel::<u64>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let displaying_tx = Mutex::new(displaying_tx);
        let release_rx = Mutex::new(release_rx);
        let sink = move |frame: Frame| {
            let _ = displaying_tx.lock().unwrap().send(frame.sequence());
            let _ = release_rx.lock().unwrap().recv();
        };
        let queue = FilterQueue::new(Arc::new(sink)).unwrap();

        queue.submit(Job::new(1, || Ok(Some(frame(1)))));
        assert_eq!(displaying_rx.recv_timeout(WAIT).unwrap(), 1);

        // The slot stays busy during display, so the newer job is dropped.
        assert_eq!(
            queue.submit(Job::new(2, || Ok(Some(frame(2))))),
            Submit::Dropped
        );
        assert!(!queue.wait_idle(Duration::from_millis(50)));

        release_tx.send(()).unwrap();
        assert!(queue.wait_idle(WAIT));
        assert_eq!(queue.stats().delivered, 1);
    }

    #[test]
    fn drain_waits_for_display_in_progress() {
        let (displaying_tx, displaying_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let displaying_tx = Mutex::new(displaying_tx);
        let release_rx = Mutex::new(release_rx);
        let shown = Arc::new(AtomicU64::new(0));
        let sink_shown = Arc::clone(&shown);
        let sink = move |_frame: Frame| {
            let _ = displaying_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
            sink_shown.fetch_add(1, Ordering::SeqCst);
        };
        let queue = Arc::new(FilterQueue::new(Arc::new(sink)).unwrap());

        queue.submit(Job::new(1, || Ok(Some(frame(1)))));
        displaying_rx.recv_timeout(WAIT).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        queue.cancel_and_drain();
        assert_eq!(shown.load(Ordering::SeqCst), 1);
        releaser.join().unwrap();
    }

    #[test]
    fn no_output_and_errors_are_not_delivered() {
        let (queue, rx) = queue();
        queue.submit(Job::new(1, || Ok(None)));
        assert!(queue.wait_idle(WAIT));
        queue.submit(Job::new(2, || Err(anyhow!("kernel failed"))));
        assert!(queue.wait_idle(WAIT));

        assert!(rx.try_recv().is_err());
        let stats = queue.stats();
        assert_eq!(stats.no_output, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn worker_survives_panicking_job() {
        let (queue, rx) = queue();
        queue.submit(Job::new(1, || panic!("strategy bug")));
        assert!(queue.wait_idle(WAIT));

        queue.submit(Job::new(2, || Ok(Some(frame(2)))));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().sequence(), 2);
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn epoch_stops_publishing_after_cancel() {
        let (queue, _rx) = queue();
        let epoch = queue.epoch();
        assert!(epoch.is_current());
        assert_eq!(epoch.run_if_current(|| 5), Some(5));

        queue.cancel();
        assert!(!epoch.is_current());
        assert_eq!(epoch.run_if_current(|| 5), None);
        assert!(queue.epoch().is_current());
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let (mut queue, _rx) = queue();
        queue.shutdown();
        assert_eq!(queue.submit(Job::new(1, || Ok(None))), Submit::Dropped);
    }
}
