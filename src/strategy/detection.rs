use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;

use super::{Strategy, StrategyKind};
use crate::classify::SharedClassifier;
use crate::frame::Frame;
use crate::queue::Epoch;
use crate::ui::UiSender;

/// Pass-through strategy that classifies frames in the background.
///
/// `process` offers the frame to a classifier thread and returns the input
/// unchanged. The offer is latest-wins: while the classifier is busy and one
/// frame is already waiting, further frames are not classified. Labels are
/// published through the epoch the strategy was built under, so a label that
/// completes after a mode switch is discarded.
pub struct Detection {
    tx: Option<SyncSender<Frame>>,
    backend: &'static str,
    skipped: u64,
}

impl Detection {
    pub fn new(classifier: SharedClassifier, epoch: Epoch, ui: UiSender) -> Result<Self> {
        // A previous Detection may still hold the classifier mid-inference.
        let backend = match classifier.try_lock() {
            Ok(guard) => guard.name(),
            Err(_) => "busy",
        };
        let (tx, rx) = mpsc::sync_channel::<Frame>(1);
        // Not joined: the thread exits once the sender is dropped and any
        // in-progress classification returns.
        thread::Builder::new()
            .name("classifier".to_string())
            .spawn(move || classify_loop(classifier, rx, epoch, ui))
            .context("failed to spawn classifier thread")?;
        log::debug!("detection started with classifier backend '{}'", backend);
        Ok(Self {
            tx: Some(tx),
            backend,
            skipped: 0,
        })
    }
}

impl Strategy for Detection {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Detection
    }

    fn process(&mut self, input: Frame) -> Result<Option<Frame>> {
        if let Some(tx) = &self.tx {
            match tx.try_send(input.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.skipped += 1;
                    log::trace!("classifier busy, frame {} not classified", input.sequence());
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!("classifier thread '{}' exited", self.backend);
                    self.tx = None;
                }
            }
        }
        Ok(Some(input))
    }
}

impl Drop for Detection {
    fn drop(&mut self) {
        self.tx = None;
        log::debug!(
            "detection stopped ({} frames skipped while classifier busy)",
            self.skipped
        );
    }
}

fn classify_loop(
    classifier: SharedClassifier,
    rx: mpsc::Receiver<Frame>,
    epoch: Epoch,
    ui: UiSender,
) {
    while let Ok(frame) = rx.recv() {
        if !epoch.is_current() {
            break;
        }
        let result = match classifier.lock() {
            Ok(mut backend) => backend.classify(
                frame.pixels(),
                frame.width(),
                frame.height(),
                frame.format(),
            ),
            Err(_) => Err(anyhow!("classifier lock poisoned")),
        };
        let sequence = frame.sequence();
        drop(frame);
        match result {
            Ok(Some(classification)) => {
                let shown = classification.to_string();
                if epoch.run_if_current(|| ui.publish_label(classification)).is_none() {
                    log::debug!("discarding label '{}' from a previous mode", shown);
                    break;
                }
                log::debug!("frame {} classified as {}", sequence, shown);
            }
            Ok(None) => {}
            Err(e) => log::warn!("classification of frame {} failed: {:#}", sequence, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, Classifier};
    use crate::frame::PixelFormat;
    use crate::queue::FilterQueue;
    use crate::ui::{self, UiEvent};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Fixed;

    impl Classifier for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn classify(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _format: PixelFormat,
        ) -> Result<Option<Classification>> {
            Ok(Some(Classification::new("mug", 0.75)))
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![1, 2, 3], 1, 1, PixelFormat::Rgb24, sequence).unwrap()
    }

    #[test]
    fn returns_input_and_publishes_label() {
        let queue = FilterQueue::new(Arc::new(|_frame: Frame| {})).unwrap();
        let (ui, events) = ui::channel();
        let classifier: SharedClassifier = Arc::new(Mutex::new(Fixed));
        let mut detection = Detection::new(classifier, queue.epoch(), ui).unwrap();

        let input = frame(1);
        let output = detection.process(input.clone()).unwrap().unwrap();
        assert!(output.shares_pixels_with(&input));

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, UiEvent::Label(Classification::new("mug", 0.75)));
    }

    #[test]
    fn no_label_after_epoch_moves_on() {
        let queue = FilterQueue::new(Arc::new(|_frame: Frame| {})).unwrap();
        let (ui, events) = ui::channel();
        let classifier: SharedClassifier = Arc::new(Mutex::new(Fixed));
        let mut detection = Detection::new(Arc::clone(&classifier), queue.epoch(), ui).unwrap();
        // Hold the classifier so the frame waits in the channel.
        let guard = classifier.lock().unwrap();
        detection.process(frame(1)).unwrap();
        queue.cancel();
        drop(guard);

        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
