use anyhow::Result;

use crate::detect::result::DetectionBox;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends receive the whole decoded frame and return boxes in its pixel
/// coordinates. They may keep internal state across frames (the motion
/// backend keeps a background model), hence `&mut self`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Errors are per-frame: the caller falls back or treats the frame as
    /// carrying no evidence, it never retries.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
