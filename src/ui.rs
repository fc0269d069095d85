//! Messages from the pipeline to the UI context.
//!
//! The UI owns the receiving end and drains it on its own thread. Nothing in
//! the pipeline touches UI state directly; mode changes and classification
//! labels arrive here as values.

use serde::Serialize;
use std::sync::mpsc;

use crate::classify::Classification;
use crate::pipeline::Mode;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    /// The pipeline finished switching to `mode`.
    ModeChanged { mode: Mode },
    /// Detection produced a label for a recent frame.
    Label(Classification),
}

/// Sending half handed to the pipeline and to Detection strategies.
#[derive(Clone, Debug)]
pub struct UiSender {
    tx: Option<mpsc::Sender<UiEvent>>,
}

impl UiSender {
    /// A sender with no UI attached. Events are discarded.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn mode_changed(&self, mode: Mode) {
        self.send(UiEvent::ModeChanged { mode });
    }

    pub fn publish_label(&self, classification: Classification) {
        self.send(UiEvent::Label(classification));
    }

    fn send(&self, event: UiEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            log::debug!("ui receiver dropped; discarding event");
        }
    }
}

/// Create a connected UI channel.
pub fn channel() -> (UiSender, mpsc::Receiver<UiEvent>) {
    let (tx, rx) = mpsc::channel();
    (UiSender { tx: Some(tx) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_receiver_in_order() {
        let (ui, rx) = channel();
        ui.mode_changed(Mode::Blur);
        ui.publish_label(Classification::new("cat", 0.9));

        assert_eq!(rx.recv().unwrap(), UiEvent::ModeChanged { mode: Mode::Blur });
        assert_eq!(
            rx.recv().unwrap(),
            UiEvent::Label(Classification::new("cat", 0.9))
        );
    }

    #[test]
    fn detached_and_orphaned_senders_do_not_fail() {
        UiSender::detached().mode_changed(Mode::Bypass);

        let (ui, rx) = channel();
        drop(rx);
        ui.publish_label(Classification::new("dog", 0.5));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&UiEvent::Label(Classification::new("cup", 0.25))).unwrap();
        assert_eq!(json, r#"{"event":"label","label":"cup","confidence":0.25}"#);

        let json = serde_json::to_string(&UiEvent::ModeChanged {
            mode: Mode::ImageComposite,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"mode_changed","mode":"image_composite"}"#);
    }
}
