use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::RawFrame;

/// Face detector capability.
///
/// Implementations receive a decoded RGB frame and return boxes in that
/// frame's pixel coordinates. Boxes may extend past the frame edge; the
/// detection stage clamps them. The stage serialises calls, so `detect` may
/// keep mutable scratch state.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the stage starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
