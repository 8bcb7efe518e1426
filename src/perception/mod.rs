mod backend;
mod backends;
mod result;

pub use backend::PerceptionBackend;
pub use backends::{HttpPerceptionBackend, StubBackend};
pub use result::{BoundingBox, FaceObservation, HandLandmarks, Landmark};
