//! Debounce and rate-limit bookkeeping.
//!
//! One primitive serves both uses:
//! - per (source, kind) minimum interval between pipeline attempts
//! - per (source, kind, identity[, gesture]) re-trigger window for outputs
//!
//! Callers pass `now` explicitly so windows can be exercised without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::identity::Gesture;
use crate::pipeline::PipelineKind;

/// Composite debounce key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub source_id: String,
    pub kind: PipelineKind,
    pub subject: Option<String>,
    pub gesture: Option<Gesture>,
}

impl DebounceKey {
    /// Key for the per-source, per-kind rate limit.
    pub fn rate(source_id: &str, kind: PipelineKind) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            subject: None,
            gesture: None,
        }
    }

    pub fn subject(source_id: &str, kind: PipelineKind, subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            ..Self::rate(source_id, kind)
        }
    }

    pub fn gesture(source_id: &str, kind: PipelineKind, subject: &str, gesture: Gesture) -> Self {
        Self {
            gesture: Some(gesture),
            ..Self::subject(source_id, kind, subject)
        }
    }
}

/// Lock-guarded map of last-fired instants.
#[derive(Debug, Default)]
pub struct Debouncer {
    last_fired: Mutex<HashMap<DebounceKey, Instant>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a firing at `now` and return true, unless the key fired less than
    /// `window` ago. The check and the update happen under one lock.
    pub fn try_fire(&self, key: DebounceKey, window: Duration, now: Instant) -> bool {
        let mut map = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = map.get(&key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        map.insert(key, now);
        true
    }

    pub fn last_fired(&self, key: &DebounceKey) -> Option<Instant> {
        let map = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).copied()
    }
}

/// One `Debouncer` per pipeline kind, shared by every worker of that kind.
#[derive(Debug, Default)]
pub struct DebounceBook {
    fire: Debouncer,
    helmet: Debouncer,
    activity: Debouncer,
    attendance: Debouncer,
}

impl DebounceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_kind(&self, kind: PipelineKind) -> &Debouncer {
        match kind {
            PipelineKind::Fire => &self.fire,
            PipelineKind::Helmet => &self.helmet,
            PipelineKind::Activity => &self.activity,
            PipelineKind::Attendance => &self.attendance,
        }
    }
}
