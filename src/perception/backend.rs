use anyhow::Result;

use crate::frame::Frame;
use crate::perception::result::{FaceObservation, HandLandmarks};

/// Face and hand perception over a single frame.
///
/// One backend instance is shared by every attendance worker, so calls take
/// `&self` and implementations synchronize internally if they need to.
/// Implementations must not retain the frame beyond the call.
pub trait PerceptionBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Face embeddings found in the frame, in detection order.
    fn faces(&self, frame: &Frame) -> Result<Vec<FaceObservation>>;

    /// Hand landmark sets found in the frame, in detection order.
    fn hands(&self, frame: &Frame) -> Result<Vec<HandLandmarks>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
