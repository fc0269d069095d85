//! Frame sources.
//!
//! A source produces `Frame`s at the device rate for the capture loop:
//! - `stub://<name>`: synthetic moving scene (tests, demos)
//! - `v4l2:///dev/videoN` or `/dev/videoN`: local V4L2 capture (feature: ingest-v4l2)
//!
//! Sources assign arrival sequence numbers. They never keep a frame once it
//! has been returned from `next_frame`.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::config::SourceSettings;
use crate::frame::Frame;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Producer of frames for the pipeline.
///
/// Not required to be `Send`: device handles may be tied to the thread that
/// opened them, so the capture loop opens its source on its own thread.
pub trait FrameSource {
    /// Open the underlying device or stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Build the source named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.as_str();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    if let Some(device) = v4l2_device(url) {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(device, settings.clone())?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "source {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    Err(anyhow!("unsupported source url '{}'", url))
}

fn v4l2_device(url: &str) -> Option<&str> {
    if let Some(path) = url.strip_prefix("v4l2://") {
        return Some(path);
    }
    url.starts_with("/dev/video").then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_open_synthetic_source() -> Result<()> {
        let settings = SourceSettings {
            url: "stub://desk".to_string(),
            width: 8,
            height: 4,
            ..SourceSettings::default()
        };
        let mut source = open_source(&settings)?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width(), frame.height()), (8, 4));
        assert_eq!(source.stats().url, "stub://desk");
        Ok(())
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let settings = SourceSettings {
            url: "rtsp://camera/stream".to_string(),
            ..SourceSettings::default()
        };
        assert!(open_source(&settings).is_err());
    }

    #[test]
    fn device_paths_are_recognised() {
        assert_eq!(v4l2_device("v4l2:///dev/video2"), Some("/dev/video2"));
        assert_eq!(v4l2_device("/dev/video0"), Some("/dev/video0"));
        assert_eq!(v4l2_device("stub://x"), None);
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn device_source_requires_feature() {
        let settings = SourceSettings {
            url: "/dev/video0".to_string(),
            ..SourceSettings::default()
        };
        let err = open_source(&settings).err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("ingest-v4l2"));
    }
}
