use anyhow::Result;

use crate::classify::result::Classification;
use crate::frame::PixelFormat;

/// Classifier backend trait.
///
/// Implementations receive the pixels of one frame for the duration of the
/// call only. They must not keep the slice (or a copy of it) once `classify`
/// returns; frame buffers are shared with the display path.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify one frame.
    ///
    /// `Ok(None)` means nothing worth reporting was found in this frame.
    fn classify(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Option<Classification>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
