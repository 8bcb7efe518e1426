use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    AttendanceRecord, BiometricRegistry, ComplianceRecord, HazardRecord, IdentityRecord,
    PersistenceSink, PipelineDirectory, PipelineRecord, SourceDirectory, SourceRecord,
};

#[derive(Default)]
struct State {
    sources: HashMap<String, SourceRecord>,
    pipelines: HashMap<String, PipelineRecord>,
    identities: Vec<IdentityRecord>,
    hazards: Vec<HazardRecord>,
    compliance: Vec<ComplianceRecord>,
    attendance: Vec<AttendanceRecord>,
}

/// Store kept entirely in memory, with switches to inject failures.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    identity_loads: AtomicU64,
    fail_identity_loads: AtomicBool,
    fail_attendance: AtomicBool,
    fail_hazards: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_source(&self, id: &str, name: &str, uri: &str) {
        self.state().sources.insert(
            id.to_string(),
            SourceRecord {
                id: id.to_string(),
                name: name.to_string(),
                uri: uri.to_string(),
            },
        );
    }

    pub fn add_pipeline(&self, id: &str, name: &str, kind: &str) {
        self.state().pipelines.insert(
            id.to_string(),
            PipelineRecord {
                id: id.to_string(),
                name: name.to_string(),
                kind: kind.to_string(),
            },
        );
    }

    pub fn add_identity(&self, external_id: &str, name: &str, template: &str) {
        self.state().identities.push(IdentityRecord {
            external_id: external_id.to_string(),
            name: name.to_string(),
            department: None,
            designation: None,
            template: template.to_string(),
        });
    }

    pub fn hazards(&self) -> Vec<HazardRecord> {
        self.state().hazards.clone()
    }

    pub fn compliance(&self) -> Vec<ComplianceRecord> {
        self.state().compliance.clone()
    }

    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        self.state().attendance.clone()
    }

    /// Number of `load_identities` calls, failed ones included.
    pub fn identity_loads(&self) -> u64 {
        self.identity_loads.load(Ordering::SeqCst)
    }

    pub fn fail_identity_loads(&self, fail: bool) {
        self.fail_identity_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_attendance(&self, fail: bool) {
        self.fail_attendance.store(fail, Ordering::SeqCst);
    }

    /// Fail hazard and compliance inserts.
    pub fn fail_hazards(&self, fail: bool) {
        self.fail_hazards.store(fail, Ordering::SeqCst);
    }
}

impl SourceDirectory for InMemoryStore {
    fn source(&self, id: &str) -> Result<Option<SourceRecord>> {
        Ok(self.state().sources.get(id).cloned())
    }
}

impl PipelineDirectory for InMemoryStore {
    fn pipeline(&self, id: &str) -> Result<Option<PipelineRecord>> {
        Ok(self.state().pipelines.get(id).cloned())
    }
}

impl BiometricRegistry for InMemoryStore {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.identity_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_identity_loads.load(Ordering::SeqCst) {
            return Err(anyhow!("identity registry unavailable"));
        }
        Ok(self.state().identities.clone())
    }
}

impl PersistenceSink for InMemoryStore {
    fn insert_hazard(&self, record: &HazardRecord) -> Result<()> {
        if self.fail_hazards.load(Ordering::SeqCst) {
            return Err(anyhow!("hazard insert rejected"));
        }
        self.state().hazards.push(record.clone());
        Ok(())
    }

    fn insert_compliance(&self, record: &ComplianceRecord) -> Result<()> {
        if self.fail_hazards.load(Ordering::SeqCst) {
            return Err(anyhow!("compliance insert rejected"));
        }
        self.state().compliance.push(record.clone());
        Ok(())
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<()> {
        if self.fail_attendance.load(Ordering::SeqCst) {
            return Err(anyhow!("attendance insert rejected"));
        }
        self.state().attendance.push(record.clone());
        Ok(())
    }
}
