//! External vision model.
//!
//! Hazard pipelines send one JPEG plus a fixed instruction and get free text
//! back. `CooldownVision` enforces the process-wide minimum spacing between
//! calls; `HttpVisionClient` talks to a generateContent-style HTTP API.

mod http;

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::pipeline::PipelineKind;

pub use http::{HttpVisionClient, VisionKeys, DEFAULT_VISION_ENDPOINT, DEFAULT_VISION_MODEL};

/// Minimum spacing between vision calls across all workers.
pub const DEFAULT_VISION_COOLDOWN: Duration = Duration::from_millis(500);

/// Per-call timeout.
pub const DEFAULT_VISION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VisionReply {
    /// Trimmed model text.
    Text(String),
    /// The call was skipped (cooldown or another call in flight). Not an error.
    NotReady,
}

pub trait VisionClient: Send + Sync {
    fn answer(&self, jpeg: &[u8], instruction: &str, kind: PipelineKind) -> Result<VisionReply>;
}

#[derive(Default)]
struct CooldownState {
    last_success: Option<Instant>,
    in_flight: bool,
}

/// Shared cooldown around another client.
///
/// At most one call runs at a time, and a new call is refused until
/// `cooldown` has passed since the last successful one. Failed calls do not
/// start a cooldown.
pub struct CooldownVision {
    inner: Arc<dyn VisionClient>,
    cooldown: Duration,
    state: Mutex<CooldownState>,
}

impl CooldownVision {
    pub fn new(inner: Arc<dyn VisionClient>, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            state: Mutex::new(CooldownState::default()),
        }
    }

    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_flight {
            return false;
        }
        if let Some(last) = state.last_success {
            if last.elapsed() < self.cooldown {
                return false;
            }
        }
        state.in_flight = true;
        true
    }

    fn finish(&self, succeeded: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight = false;
        if succeeded {
            state.last_success = Some(Instant::now());
        }
    }
}

impl VisionClient for CooldownVision {
    fn answer(&self, jpeg: &[u8], instruction: &str, kind: PipelineKind) -> Result<VisionReply> {
        if !self.try_begin() {
            log::debug!("vision call for {} skipped: cooling down", kind.as_str());
            return Ok(VisionReply::NotReady);
        }
        let result = self.inner.answer(jpeg, instruction, kind);
        self.finish(matches!(result, Ok(VisionReply::Text(_))));
        result
    }
}
