//! Analysis pipelines and the worker that drives them.
//!
//! A pipeline consumes one sampled frame at a time and reports what it did.
//! Every pipeline shares the same collaborators through `PipelineContext`;
//! each worker owns its own boxed `Pipeline` instance.

mod attendance;
mod hazard;
mod worker;

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::debounce::{DebounceBook, DebounceKey};
use crate::events::EventLog;
use crate::frame::Frame;
use crate::identity::{BiometricCache, DEFAULT_MATCH_THRESHOLD};
use crate::perception::PerceptionBackend;
use crate::store::{PersistenceSink, SourceRecord};
use crate::vision::VisionClient;

pub use attendance::AttendancePipeline;
pub use hazard::{classify, instruction, HazardPipeline, Verdict};
pub use worker::{
    Backoff, PipelineWorker, WorkerCounters, WorkerSettings, WorkerStats, DEFAULT_FRAME_STRIDE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Fire,
    Helmet,
    Activity,
    Attendance,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Fire,
        PipelineKind::Helmet,
        PipelineKind::Activity,
        PipelineKind::Attendance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Fire => "fire",
            PipelineKind::Helmet => "helmet",
            PipelineKind::Activity => "activity",
            PipelineKind::Attendance => "attendance",
        }
    }

    /// Parse a stored kind tag. Accepts the legacy model names as aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fire" | "fire_detection" => Some(PipelineKind::Fire),
            "helmet" | "compliance" | "helmet_detection" => Some(PipelineKind::Helmet),
            "activity" | "anomaly" | "activity_detection" => Some(PipelineKind::Activity),
            "attendance" | "identity" | "face_recognition" => Some(PipelineKind::Attendance),
            _ => None,
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            PipelineKind::Fire => Duration::from_secs(3),
            PipelineKind::Helmet | PipelineKind::Activity => Duration::from_secs(5),
            PipelineKind::Attendance => Duration::from_secs(2),
        }
    }
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pipeline did with one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Skipped: the per-source interval for this kind has not elapsed.
    RateLimited,
    /// Skipped: the vision model was cooling down.
    NotReady,
    /// Ran to completion; ids of the events it appended.
    Completed { events: Vec<u64> },
}

pub trait Pipeline: Send {
    fn kind(&self) -> PipelineKind;

    /// Analyse one frame. `now` drives every debounce decision.
    fn process(&mut self, frame: &Frame, now: Instant) -> Result<Outcome>;
}

/// Minimum spacing between attempts, per kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intervals {
    pub fire: Duration,
    pub helmet: Duration,
    pub activity: Duration,
    pub attendance: Duration,
}

impl Intervals {
    pub fn for_kind(&self, kind: PipelineKind) -> Duration {
        match kind {
            PipelineKind::Fire => self.fire,
            PipelineKind::Helmet => self.helmet,
            PipelineKind::Activity => self.activity,
            PipelineKind::Attendance => self.attendance,
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            fire: PipelineKind::Fire.default_interval(),
            helmet: PipelineKind::Helmet.default_interval(),
            activity: PipelineKind::Activity.default_interval(),
            attendance: PipelineKind::Attendance.default_interval(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentitySettings {
    pub match_threshold: f32,
    /// Re-trigger window for `face_matched` per (source, identity).
    pub face_window: Duration,
    /// Re-trigger window for attendance per (source, identity, gesture).
    pub attendance_window: Duration,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            face_window: Duration::from_secs(5),
            attendance_window: Duration::from_secs(10),
        }
    }
}

/// Collaborators shared by every pipeline instance.
#[derive(Clone)]
pub struct PipelineContext {
    pub events: Arc<EventLog>,
    pub debounce: Arc<DebounceBook>,
    pub sink: Arc<dyn PersistenceSink>,
    pub vision: Arc<dyn VisionClient>,
    pub perception: Arc<dyn PerceptionBackend>,
    pub biometrics: Arc<BiometricCache>,
    pub intervals: Intervals,
    pub identity: IdentitySettings,
}

impl PipelineContext {
    /// Claim the per-(source, kind) rate slot. False while the interval runs.
    pub(crate) fn claim_rate(&self, source_id: &str, kind: PipelineKind, now: Instant) -> bool {
        self.debounce.for_kind(kind).try_fire(
            DebounceKey::rate(source_id, kind),
            self.intervals.for_kind(kind),
            now,
        )
    }
}

/// Build the pipeline for `kind` bound to one source.
pub fn build_pipeline(
    kind: PipelineKind,
    source: &SourceRecord,
    ctx: &PipelineContext,
) -> Box<dyn Pipeline> {
    match kind {
        PipelineKind::Attendance => Box::new(AttendancePipeline::new(source, ctx.clone())),
        hazard => Box::new(HazardPipeline::new(hazard, source, ctx.clone())),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::identity::DEFAULT_TEMPLATE_DIM;
    use crate::perception::StubBackend;
    use crate::store::InMemoryStore;
    use crate::vision::testing::FixedVision;

    pub struct Harness {
        pub store: Arc<InMemoryStore>,
        pub vision: Arc<FixedVision>,
        pub perception: Arc<StubBackend>,
        pub ctx: PipelineContext,
    }

    pub fn harness(template_dim: usize) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let vision = Arc::new(FixedVision::replying("No fire detected"));
        let perception = Arc::new(StubBackend::new());
        let ctx = PipelineContext {
            events: Arc::new(EventLog::default()),
            debounce: Arc::new(DebounceBook::new()),
            sink: store.clone(),
            vision: vision.clone(),
            perception: perception.clone(),
            biometrics: Arc::new(BiometricCache::new(store.clone(), template_dim)),
            intervals: Intervals::default(),
            identity: IdentitySettings::default(),
        };
        Harness {
            store,
            vision,
            perception,
            ctx,
        }
    }

    pub fn default_harness() -> Harness {
        harness(DEFAULT_TEMPLATE_DIM)
    }

    pub fn source() -> SourceRecord {
        SourceRecord {
            id: "cam1".to_string(),
            name: "Gate".to_string(),
            uri: "stub://gate".to_string(),
        }
    }
}
