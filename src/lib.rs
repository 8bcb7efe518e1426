//! sitewatch
//!
//! Multi-camera site monitoring core. Frames are pulled from many video
//! sources, sampled per (source, pipeline) pair, analysed for hazards or
//! identity and gesture attendance, and published to a bounded event log that
//! consumers poll.
//!
//! # Module Structure
//!
//! - `source`: source registry, handles and transports
//! - `pipeline`: hazard and attendance pipelines, the worker loop
//! - `supervisor`: starts and stops workers per (source, pipeline)
//! - `identity`: biometric template cache, matching, gestures
//! - `events`: bounded event log with cursor polling
//! - `debounce`: shared rate-limit and re-trigger bookkeeping
//! - `store`, `vision`, `perception`: collaborator interfaces and adapters
//! - `config`, `runtime`: daemon configuration and wiring

use std::sync::OnceLock;

pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod frame;
pub mod identity;
pub mod perception;
pub mod pipeline;
pub mod runtime;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod vision;

pub use debounce::{DebounceBook, DebounceKey, Debouncer};
pub use error::{ControlError, SourceError};
pub use events::{Event, EventKind, EventLog, DEFAULT_EVENT_CAPACITY};
pub use frame::Frame;
pub use identity::{BiometricCache, BiometricTemplate, Gesture, IdentityMeta};
pub use pipeline::{Outcome, Pipeline, PipelineContext, PipelineKind};
pub use runtime::Sitewatch;
pub use source::{SourceRegistry, SourceState};
pub use supervisor::{PipelineSupervisor, WorkerStatus};

const ID_PATTERN: &str = r"^[A-Za-z0-9_.:-]{1,64}$";

/// Source and pipeline ids: 1..=64 of `[A-Za-z0-9_.:-]`.
pub fn validate_id(id: &str) -> bool {
    static ID_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    ID_RE
        .get_or_init(|| regex::Regex::new(ID_PATTERN).ok())
        .as_ref()
        .map(|re| re.is_match(id))
        .unwrap_or(false)
}
