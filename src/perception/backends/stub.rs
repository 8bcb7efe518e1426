use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::frame::Frame;
use crate::perception::backend::PerceptionBackend;
use crate::perception::result::{FaceObservation, HandLandmarks};

/// Scripted backend for tests and for running without a perception service.
///
/// Returns whatever faces and hands were last set, for every frame.
#[derive(Default)]
pub struct StubBackend {
    faces: Mutex<Vec<FaceObservation>>,
    hands: Mutex<Vec<HandLandmarks>>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faces(&self, faces: Vec<FaceObservation>) {
        *self.faces.lock().unwrap_or_else(|e| e.into_inner()) = faces;
    }

    pub fn set_hands(&self, hands: Vec<HandLandmarks>) {
        *self.hands.lock().unwrap_or_else(|e| e.into_inner()) = hands;
    }

    /// Make every call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `faces` calls served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("stub perception backend set to fail"));
        }
        Ok(())
    }
}

impl PerceptionBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn faces(&self, _frame: &Frame) -> Result<Vec<FaceObservation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.faces.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn hands(&self, _frame: &Frame) -> Result<Vec<HandLandmarks>> {
        self.check()?;
        Ok(self.hands.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_scripted_observations() -> Result<()> {
        let backend = StubBackend::new();
        let frame = Frame::filled(4, 4, [0, 0, 0])?;
        assert!(backend.faces(&frame)?.is_empty());

        backend.set_faces(vec![FaceObservation {
            embedding: vec![0.1, 0.2],
            bbox: None,
        }]);
        assert_eq!(backend.faces(&frame)?.len(), 1);
        assert_eq!(backend.calls(), 2);

        backend.set_failing(true);
        assert!(backend.hands(&frame).is_err());
        Ok(())
    }
}
