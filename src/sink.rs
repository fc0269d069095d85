//! Display-side frame consumers.

use std::sync::mpsc;

use crate::frame::Frame;

/// Consumer of finished frames.
///
/// `display` is called from the frame delivery thread (bypass) or the filter
/// queue worker (filtering), never concurrently for the same pipeline
/// instance's filtered output. Implementations should hand the frame off and
/// return quickly.
pub trait FrameSink: Send + Sync {
    fn display(&self, frame: Frame);
}

impl<F> FrameSink for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn display(&self, frame: Frame) {
        self(frame)
    }
}

/// Sink that forwards frames to a display thread over a channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn display(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            log::debug!("display receiver dropped; discarding frame");
        }
    }
}
