//! Identity matching.
//!
//! - `BiometricTemplate`: a decoded reference embedding plus who it belongs to.
//! - `BiometricCache`: templates loaded lazily per source from the
//!   `BiometricRegistry`, kept until explicitly invalidated.
//! - `nearest_template` / `BiometricCache::match_faces`: Euclidean
//!   nearest-neighbor with an acceptance threshold.
//! - `gesture`: landmark geometry for the attendance gestures.

mod codec;
pub mod gesture;

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroize;

use crate::perception::FaceObservation;
use crate::store::{BiometricRegistry, IdentityRecord};

pub use codec::{decode_template, encode_template};
pub use gesture::{classify_gesture, first_gesture, Gesture};

/// Embedding length produced by the reference face encoder.
pub const DEFAULT_TEMPLATE_DIM: usize = 128;

/// Maximum normalized embedding distance accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

/// Who a template belongs to.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct IdentityMeta {
    pub external_id: String,
    pub name: String,
    pub department: Option<String>,
    pub designation: Option<String>,
}

/// Immutable reference embedding.
#[derive(Debug)]
pub struct BiometricTemplate {
    embedding: Vec<f32>,
    pub identity: IdentityMeta,
}

impl BiometricTemplate {
    pub fn new(embedding: Vec<f32>, identity: IdentityMeta) -> Self {
        Self {
            embedding,
            identity,
        }
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn dim(&self) -> usize {
        self.embedding.len()
    }

    /// Euclidean distance to a probe, or `None` if the lengths differ.
    pub fn distance(&self, probe: &[f32]) -> Option<f32> {
        euclidean(&self.embedding, probe)
    }
}

impl Drop for BiometricTemplate {
    fn drop(&mut self) {
        self.embedding.zeroize();
    }
}

/// An accepted face match.
#[derive(Clone, Debug)]
pub struct FaceMatch {
    pub template: Arc<BiometricTemplate>,
    pub distance: f32,
}

pub fn euclidean(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Index and distance of the closest template. The first minimum wins ties;
/// templates of a different dimension or with a non-finite distance are ignored.
pub fn nearest_template(templates: &[Arc<BiometricTemplate>], probe: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, template) in templates.iter().enumerate() {
        let Some(distance) = template.distance(probe).filter(|d| d.is_finite()) else {
            continue;
        };
        match best {
            Some((_, d)) if d <= distance => {}
            _ => best = Some((idx, distance)),
        }
    }
    best
}

/// Accepted matches for each face, in face order. Faces whose nearest template
/// is not strictly below `threshold` are dropped.
pub fn match_faces(
    templates: &[Arc<BiometricTemplate>],
    faces: &[FaceObservation],
    threshold: f32,
) -> Vec<FaceMatch> {
    faces
        .iter()
        .filter_map(|face| {
            let (idx, distance) = nearest_template(templates, &face.embedding)?;
            (distance < threshold).then(|| FaceMatch {
                template: templates[idx].clone(),
                distance,
            })
        })
        .collect()
}

type TemplateSet = Arc<Vec<Arc<BiometricTemplate>>>;

/// Per-source template cache.
///
/// The outer map lock is held only to find the source's slot; the load itself
/// runs under the slot lock, so a slow registry on one source does not stall
/// pipelines on another.
pub struct BiometricCache {
    registry: Arc<dyn BiometricRegistry>,
    dim: usize,
    slots: Mutex<HashMap<String, Arc<Mutex<Option<TemplateSet>>>>>,
}

impl BiometricCache {
    pub fn new(registry: Arc<dyn BiometricRegistry>, dim: usize) -> Self {
        Self {
            registry,
            dim,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Templates for `source_id`, fetching from the registry on first use.
    ///
    /// Undecodable entries are skipped. A registry failure is returned and
    /// nothing is cached, so the next call tries again.
    pub fn load(&self, source_id: &str) -> Result<TemplateSet> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(source_id.to_string()).or_default().clone()
        };
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = guard.as_ref() {
            return Ok(set.clone());
        }

        let records = self.registry.load_identities()?;
        let set: TemplateSet = Arc::new(self.decode_records(source_id, records));
        log::info!(
            "preloaded {} identity templates for source {}",
            set.len(),
            source_id
        );
        *guard = Some(set.clone());
        Ok(set)
    }

    fn decode_records(&self, source_id: &str, records: Vec<IdentityRecord>) -> Vec<Arc<BiometricTemplate>> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let embedding = match decode_template(&record.template) {
                Ok(v) => v,
                Err(err) => {
                    log::error!(
                        "skipping template for identity {} (source {}): {:#}",
                        record.external_id,
                        source_id,
                        err
                    );
                    continue;
                }
            };
            if embedding.len() != self.dim {
                log::error!(
                    "skipping template for identity {} (source {}): expected {} values, got {}",
                    record.external_id,
                    source_id,
                    self.dim,
                    embedding.len()
                );
                continue;
            }
            out.push(Arc::new(BiometricTemplate::new(
                embedding,
                IdentityMeta {
                    external_id: record.external_id,
                    name: record.name,
                    department: record.department,
                    designation: record.designation,
                },
            )));
        }
        out
    }

    /// Match faces against the source's templates.
    pub fn match_faces(
        &self,
        source_id: &str,
        faces: &[FaceObservation],
        threshold: f32,
    ) -> Result<Vec<FaceMatch>> {
        let templates = self.load(source_id)?;
        Ok(match_faces(&templates, faces, threshold))
    }

    pub fn is_loaded(&self, source_id: &str) -> bool {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(source_id).cloned()
        };
        slot.map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).is_some())
            .unwrap_or(false)
    }

    /// Drop the cached templates for one source; the next load refetches.
    pub fn invalidate(&self, source_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(source_id);
    }

    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }
}
