//! Collaborator interfaces for configuration lookups and persistence.
//!
//! The core only talks to these traits. `SqliteStore` is the production
//! adapter; `InMemoryStore` backs tests and dry runs.

mod memory;
mod sqlite;

use anyhow::Result;
use serde::Serialize;

use crate::identity::Gesture;
use crate::pipeline::PipelineKind;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineRecord {
    pub id: String,
    pub name: String,
    /// Free-form kind tag as stored; parsed with `PipelineKind::parse`.
    pub kind: String,
}

/// Identity row with its still-serialized template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRecord {
    pub external_id: String,
    pub name: String,
    pub department: Option<String>,
    pub designation: Option<String>,
    pub template: String,
}

/// Fire or activity verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HazardRecord {
    pub source_id: String,
    pub source_name: String,
    pub category: PipelineKind,
    /// Classification label, e.g. `fire_detected` or `indeterminate`.
    pub verdict: String,
    /// Raw model reply.
    pub detected: String,
    pub created_at_ms: u64,
}

/// Helmet compliance verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComplianceRecord {
    pub source_id: String,
    pub source_name: String,
    pub verdict: String,
    pub detected: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub external_id: String,
    pub source_id: String,
    pub gesture: Gesture,
    pub created_at_ms: u64,
}

pub trait SourceDirectory: Send + Sync {
    /// `Ok(None)` when the id is unknown.
    fn source(&self, id: &str) -> Result<Option<SourceRecord>>;
}

pub trait PipelineDirectory: Send + Sync {
    /// `Ok(None)` when the id is unknown.
    fn pipeline(&self, id: &str) -> Result<Option<PipelineRecord>>;
}

pub trait BiometricRegistry: Send + Sync {
    /// Every identity that has a template.
    fn load_identities(&self) -> Result<Vec<IdentityRecord>>;
}

pub trait PersistenceSink: Send + Sync {
    fn insert_hazard(&self, record: &HazardRecord) -> Result<()>;
    fn insert_compliance(&self, record: &ComplianceRecord) -> Result<()>;
    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<()>;
}

