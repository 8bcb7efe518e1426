//! Starts and stops pipeline workers.
//!
//! One worker thread per (source, pipeline) pair. The pair is reserved under
//! the worker map lock before any lookup or source open, so two concurrent
//! starts for the same pair cannot both succeed. Stop is cooperative: it
//! clears the worker's running flag and returns; the thread exits at its next
//! loop iteration.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::ControlError;
use crate::frame::now_ms;
use crate::pipeline::{
    build_pipeline, PipelineContext, PipelineKind, PipelineWorker, WorkerCounters, WorkerSettings,
    WorkerStats,
};
use crate::source::SourceRegistry;
use crate::store::{PipelineDirectory, SourceDirectory};

type PairKey = (String, String);

struct WorkerEntry {
    kind: Option<PipelineKind>,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    started_at_ms: u64,
    thread: Option<JoinHandle<()>>,
}

impl WorkerEntry {
    /// Reserved entries (no thread yet) count as live.
    fn is_live(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(true)
    }
}

/// Point-in-time view of one worker.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub source_id: String,
    pub pipeline_id: String,
    pub kind: Option<PipelineKind>,
    pub running: bool,
    pub started_at_ms: u64,
    #[serde(flatten)]
    pub counters: WorkerCounters,
}

pub struct PipelineSupervisor {
    registry: Arc<SourceRegistry>,
    sources: Arc<dyn SourceDirectory>,
    pipelines: Arc<dyn PipelineDirectory>,
    context: PipelineContext,
    settings: WorkerSettings,
    workers: Mutex<HashMap<PairKey, WorkerEntry>>,
}

impl PipelineSupervisor {
    pub fn new(
        registry: Arc<SourceRegistry>,
        sources: Arc<dyn SourceDirectory>,
        pipelines: Arc<dyn PipelineDirectory>,
        context: PipelineContext,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            sources,
            pipelines,
            context,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<PairKey, WorkerEntry>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(source_id: &str, pipeline_id: &str) -> PairKey {
        (source_id.to_string(), pipeline_id.to_string())
    }

    /// Start a worker for the pair. Returns once the thread is spawned.
    pub fn start(&self, source_id: &str, pipeline_id: &str) -> Result<(), ControlError> {
        if !crate::validate_id(source_id) {
            return Err(ControlError::SourceNotFound(source_id.to_string()));
        }
        if !crate::validate_id(pipeline_id) {
            return Err(ControlError::PipelineNotFound(pipeline_id.to_string()));
        }

        let key = Self::key(source_id, pipeline_id);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkerStats::default());
        {
            let mut workers = self.workers();
            if workers.get(&key).map(WorkerEntry::is_live).unwrap_or(false) {
                return Err(ControlError::AlreadyRunning {
                    source_id: source_id.to_string(),
                    pipeline_id: pipeline_id.to_string(),
                });
            }
            // A finished worker's thread is detached when its entry is replaced.
            workers.insert(
                key.clone(),
                WorkerEntry {
                    kind: None,
                    running: running.clone(),
                    stats: stats.clone(),
                    started_at_ms: now_ms(),
                    thread: None,
                },
            );
        }

        match self.launch(source_id, pipeline_id, running.clone(), stats) {
            Ok((kind, thread)) => {
                let mut workers = self.workers();
                match workers.get_mut(&key) {
                    Some(entry) if Arc::ptr_eq(&entry.running, &running) => {
                        entry.kind = Some(kind);
                        entry.thread = Some(thread);
                    }
                    // Entry was dropped by shutdown while launching.
                    _ => running.store(false, Ordering::SeqCst),
                }
                log::info!("started {} pipeline {} on source {}", kind, pipeline_id, source_id);
                Ok(())
            }
            Err(err) => {
                let mut workers = self.workers();
                if workers
                    .get(&key)
                    .map(|entry| Arc::ptr_eq(&entry.running, &running))
                    .unwrap_or(false)
                {
                    workers.remove(&key);
                }
                log::warn!(
                    "failed to start pipeline {} on source {}: {}",
                    pipeline_id,
                    source_id,
                    err
                );
                Err(err)
            }
        }
    }

    fn launch(
        &self,
        source_id: &str,
        pipeline_id: &str,
        running: Arc<AtomicBool>,
        stats: Arc<WorkerStats>,
    ) -> Result<(PipelineKind, JoinHandle<()>), ControlError> {
        let source = self
            .sources
            .source(source_id)?
            .ok_or_else(|| ControlError::SourceNotFound(source_id.to_string()))?;
        let record = self
            .pipelines
            .pipeline(pipeline_id)?
            .ok_or_else(|| ControlError::PipelineNotFound(pipeline_id.to_string()))?;
        let kind = PipelineKind::parse(&record.kind).ok_or_else(|| {
            log::warn!("pipeline {} has unknown kind {:?}", pipeline_id, record.kind);
            ControlError::PipelineNotFound(pipeline_id.to_string())
        })?;

        self.registry.acquire(source_id, &source.uri)?;

        let pipeline = build_pipeline(kind, &source, &self.context);
        let worker = PipelineWorker::new(
            source_id,
            pipeline_id,
            &source.uri,
            self.registry.clone(),
            pipeline,
            self.context.events.clone(),
            running,
            stats,
            self.settings.clone(),
        );
        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", kind, source_id))
            .spawn(move || worker.run())
            .map_err(|e| ControlError::Spawn(e.to_string()))?;
        Ok((kind, thread))
    }

    /// Ask the pair's worker to stop. Does not wait and does not release the source.
    pub fn stop(&self, source_id: &str, pipeline_id: &str) -> Result<(), ControlError> {
        let key = Self::key(source_id, pipeline_id);
        let mut workers = self.workers();
        let live = workers.get(&key).map(WorkerEntry::is_live).unwrap_or(false);
        if !live {
            workers.remove(&key);
            return Err(ControlError::NotRunning {
                source_id: source_id.to_string(),
                pipeline_id: pipeline_id.to_string(),
            });
        }
        if let Some(entry) = workers.get(&key) {
            entry.running.store(false, Ordering::SeqCst);
        }
        log::info!("stopping pipeline {} on source {}", pipeline_id, source_id);
        Ok(())
    }

    pub fn is_running(&self, source_id: &str, pipeline_id: &str) -> bool {
        self.workers()
            .get(&Self::key(source_id, pipeline_id))
            .map(WorkerEntry::is_live)
            .unwrap_or(false)
    }

    /// Every known worker, live or finished, sorted by pair.
    pub fn status(&self) -> Vec<WorkerStatus> {
        let workers = self.workers();
        let mut out: Vec<WorkerStatus> = workers
            .iter()
            .map(|((source_id, pipeline_id), entry)| WorkerStatus {
                source_id: source_id.clone(),
                pipeline_id: pipeline_id.clone(),
                kind: entry.kind,
                running: entry.is_live(),
                started_at_ms: entry.started_at_ms,
                counters: entry.stats.counters(),
            })
            .collect();
        out.sort_by(|a, b| (&a.source_id, &a.pipeline_id).cmp(&(&b.source_id, &b.pipeline_id)));
        out
    }

    /// Stop every worker and wait for the threads to exit.
    pub fn shutdown(&self) {
        let entries: Vec<(PairKey, WorkerEntry)> = self.workers().drain().collect();
        for (_, entry) in &entries {
            entry.running.store(false, Ordering::SeqCst);
        }
        for ((source_id, pipeline_id), entry) in entries {
            if let Some(thread) = entry.thread {
                if thread.join().is_err() {
                    log::error!("worker {}/{} panicked", source_id, pipeline_id);
                }
            }
        }
        log::info!("all pipeline workers stopped");
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
