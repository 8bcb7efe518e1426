//! Bounded in-memory event log.
//!
//! Producers (pipeline workers) append concurrently; consumers poll with a
//! cursor (`since`) or ask for the tail (`latest`). Ids are assigned under the
//! write lock, so they strictly increase in append order and are never
//! reused, even after eviction.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::frame::now_ms;

/// Default number of retained events.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Closed set of event kinds.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FireDetected,
    FireClear,
    /// Person observed wearing a helmet.
    HelmetDetection,
    HelmetViolation,
    ActivityDetected,
    ActivityClear,
    FaceMatched,
    AttendanceLogged,
    SourceFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FireDetected => "fire_detected",
            EventKind::FireClear => "fire_clear",
            EventKind::HelmetDetection => "helmet_detection",
            EventKind::HelmetViolation => "helmet_violation",
            EventKind::ActivityDetected => "activity_detected",
            EventKind::ActivityClear => "activity_clear",
            EventKind::FaceMatched => "face_matched",
            EventKind::AttendanceLogged => "attendance_logged",
            EventKind::SourceFailed => "source_failed",
        }
    }
}

/// Immutable event record. Fields are private; read them through accessors.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    id: u64,
    kind: EventKind,
    data: Value,
    created_at_ms: u64,
}

impl Event {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

struct Inner {
    next_id: u64,
    entries: VecDeque<Event>,
}

/// Thread-safe bounded event log.
pub struct EventLog {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(Inner {
                next_id: 1,
                entries: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event and return its id. Evicts the oldest entry when full.
    pub fn append(&self, kind: EventKind, data: Value) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push_back(Event {
            id,
            kind,
            data,
            created_at_ms: now_ms(),
        });
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
        log::debug!("event #{} {}", id, kind.as_str());
        id
    }

    /// Every retained event with id greater than `cursor`, oldest first.
    pub fn since(&self, cursor: u64) -> Vec<Event> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        // Ids are contiguous within the deque, so the start index is direct.
        let first = match inner.entries.front() {
            Some(ev) => ev.id,
            None => return Vec::new(),
        };
        let skip = cursor.saturating_sub(first - 1) as usize;
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// The `k` most recent events, oldest first.
    pub fn latest(&self, k: usize) -> Vec<Event> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let skip = inner.entries.len().saturating_sub(k);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// Id of the newest event, or 0 if nothing was ever appended.
    pub fn last_id(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.next_id - 1
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
