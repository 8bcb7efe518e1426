//! Wiring of the core from a `SitewatchConfig`.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::SitewatchConfig;
use crate::debounce::DebounceBook;
use crate::events::EventLog;
use crate::identity::BiometricCache;
use crate::perception::{HttpPerceptionBackend, PerceptionBackend, StubBackend};
use crate::pipeline::PipelineContext;
use crate::source::{default_transports, SourceRegistry};
use crate::store::{
    BiometricRegistry, PersistenceSink, PipelineDirectory, SourceDirectory, SqliteStore,
};
use crate::supervisor::PipelineSupervisor;
use crate::vision::{CooldownVision, HttpVisionClient, VisionClient};

/// Stores the core runs against, one handle per role.
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn SourceDirectory>,
    pub pipelines: Arc<dyn PipelineDirectory>,
    pub biometrics: Arc<dyn BiometricRegistry>,
    pub sink: Arc<dyn PersistenceSink>,
    pub vision: Arc<dyn VisionClient>,
    pub perception: Arc<dyn PerceptionBackend>,
}

impl Collaborators {
    /// Production adapters: SQLite store, HTTP vision and perception clients.
    pub fn from_config(cfg: &SitewatchConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&cfg.db_path)?);
        let vision = HttpVisionClient::with_timeout(
            &cfg.vision.endpoint,
            &cfg.vision.model,
            cfg.vision.keys.clone(),
            cfg.vision.timeout,
        );
        let perception: Arc<dyn PerceptionBackend> = match &cfg.perception.url {
            Some(url) => Arc::new(
                HttpPerceptionBackend::with_timeout(url, cfg.perception.timeout)
                    .context("configure perception backend")?,
            ),
            None => {
                log::warn!("no perception url configured; attendance pipelines will see no faces");
                Arc::new(StubBackend::new())
            }
        };
        Ok(Self {
            sources: store.clone(),
            pipelines: store.clone(),
            biometrics: store.clone(),
            sink: store,
            vision: Arc::new(vision),
            perception,
        })
    }
}

/// A running core: registry, supervisor and the shared event log.
pub struct Sitewatch {
    pub events: Arc<EventLog>,
    pub registry: Arc<SourceRegistry>,
    pub supervisor: PipelineSupervisor,
}

impl Sitewatch {
    pub fn new(cfg: &SitewatchConfig, collaborators: Collaborators) -> Self {
        let registry = Arc::new(
            SourceRegistry::new(default_transports(), cfg.sources.capture.clone())
                .with_fallback(cfg.sources.fallback_uri.clone())
                .with_error_threshold(cfg.sources.error_threshold)
                .with_restart_pause(cfg.sources.restart_pause),
        );
        let events = Arc::new(EventLog::new(cfg.event_capacity));
        let context = PipelineContext {
            events: events.clone(),
            debounce: Arc::new(DebounceBook::new()),
            sink: collaborators.sink,
            vision: Arc::new(CooldownVision::new(collaborators.vision, cfg.vision.cooldown)),
            perception: collaborators.perception,
            biometrics: Arc::new(BiometricCache::new(collaborators.biometrics, cfg.template_dim)),
            intervals: cfg.intervals.clone(),
            identity: cfg.identity.clone(),
        };
        let supervisor = PipelineSupervisor::new(
            registry.clone(),
            collaborators.sources,
            collaborators.pipelines,
            context,
            cfg.workers.clone(),
        );
        Self {
            events,
            registry,
            supervisor,
        }
    }

    /// Start every configured assignment. Failures are logged and skipped.
    pub fn start_assignments(&self, cfg: &SitewatchConfig) -> usize {
        let mut started = 0;
        for assignment in &cfg.assignments {
            match self
                .supervisor
                .start(&assignment.source_id, &assignment.pipeline_id)
            {
                Ok(()) => started += 1,
                Err(err) => log::error!(
                    "assignment {}:{} not started: {}",
                    assignment.source_id,
                    assignment.pipeline_id,
                    err
                ),
            }
        }
        started
    }

    /// Forget cached templates so attendance workers reload them on their next
    /// frame. `None` covers every source.
    pub fn reload_identities(&self, source_id: Option<&str>) {
        let cache = &self.supervisor.context().biometrics;
        match source_id {
            Some(id) => {
                cache.invalidate(id);
                log::info!("identity templates for source {} will reload", id);
            }
            None => {
                cache.invalidate_all();
                log::info!("identity templates for all sources will reload");
            }
        }
    }

    /// Stop all workers, then close all sources.
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        self.registry.release_all();
    }
}
