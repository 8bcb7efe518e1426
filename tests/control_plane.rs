use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sitewatch::config::SitewatchConfig;
use sitewatch::perception::StubBackend;
use sitewatch::pipeline::PipelineKind;
use sitewatch::runtime::Collaborators;
use sitewatch::store::InMemoryStore;
use sitewatch::vision::{VisionClient, VisionReply};
use sitewatch::{ControlError, EventKind, Sitewatch, SourceState};

struct CannedVision {
    reply: String,
    calls: AtomicU64,
}

impl VisionClient for CannedVision {
    fn answer(&self, _jpeg: &[u8], _instruction: &str, _kind: PipelineKind) -> Result<VisionReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VisionReply::Text(self.reply.clone()))
    }
}

fn config() -> Result<SitewatchConfig> {
    let mut cfg = SitewatchConfig::load_from(None)?;
    cfg.workers.frame_stride = 1;
    cfg.workers.error_pause = Duration::from_millis(10);
    cfg.workers.backoff_initial = Duration::from_millis(1);
    cfg.workers.backoff_max = Duration::from_millis(5);
    cfg.sources.error_threshold = 3;
    cfg.sources.capture.width = 32;
    cfg.sources.capture.height = 24;
    cfg.sources.capture.fps = 0;
    cfg.vision.cooldown = Duration::ZERO;
    Ok(cfg)
}

fn core(store: &Arc<InMemoryStore>, reply: &str) -> Result<Sitewatch> {
    let cfg = config()?;
    let collaborators = Collaborators {
        sources: store.clone(),
        pipelines: store.clone(),
        biometrics: store.clone(),
        sink: store.clone(),
        vision: Arc::new(CannedVision {
            reply: reply.to_string(),
            calls: AtomicU64::new(0),
        }),
        perception: Arc::new(StubBackend::new()),
    };
    Ok(Sitewatch::new(&cfg, collaborators))
}

fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.add_source("gate", "Main Gate", "stub://gate");
    store.add_source("flaky", "Loading Bay", "stub://flaky?fail_after=5");
    store.add_source("dark", "Back Lot", "stub://offline");
    store.add_pipeline("fire", "Fire watch", "fire");
    store.add_pipeline("ppe", "Helmet compliance", "compliance");
    store
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn fire_reply_reaches_store_and_event_log() -> Result<()> {
    let store = seeded_store();
    let core = core(&store, "Fire detected near the generator")?;
    core.supervisor.start("gate", "fire")?;

    assert!(wait_until(Duration::from_secs(10), || {
        core.events
            .since(0)
            .iter()
            .any(|e| e.kind() == EventKind::FireDetected)
    }));
    let event = core
        .events
        .since(0)
        .into_iter()
        .find(|e| e.kind() == EventKind::FireDetected)
        .expect("fire event");
    assert_eq!(event.data()["requires_immediate_action"], true);
    assert_eq!(event.data()["camera_name"], "Main Gate");
    assert!(store
        .hazards()
        .iter()
        .all(|h| h.verdict == "fire_detected" && h.category == PipelineKind::Fire));

    core.shutdown();
    assert_eq!(core.registry.state("gate"), SourceState::Unopened);
    Ok(())
}

#[test]
fn no_fire_reply_never_raises_fire() -> Result<()> {
    let store = seeded_store();
    let core = core(&store, "No fire detected")?;
    core.supervisor.start("gate", "fire")?;

    assert!(wait_until(Duration::from_secs(10), || !store.hazards().is_empty()));
    core.shutdown();

    assert!(store.hazards().iter().all(|h| h.verdict == "fire_clear"));
    assert!(core
        .events
        .since(0)
        .iter()
        .all(|e| e.kind() != EventKind::FireDetected));
    Ok(())
}

#[test]
fn duplicate_start_and_idle_stop_are_rejected() -> Result<()> {
    let store = seeded_store();
    let core = core(&store, "Helmet detected")?;

    core.supervisor.start("gate", "ppe")?;
    assert!(matches!(
        core.supervisor.start("gate", "ppe"),
        Err(ControlError::AlreadyRunning { .. })
    ));
    // A different pipeline on the same source is its own pair.
    core.supervisor.start("gate", "fire")?;

    core.supervisor.stop("gate", "ppe")?;
    assert!(matches!(
        core.supervisor.stop("gate", "ppe"),
        Err(ControlError::NotRunning { .. })
    ));
    assert!(core.supervisor.is_running("gate", "fire"));
    assert!(core.registry.is_healthy("gate"));

    core.shutdown();
    Ok(())
}

#[test]
fn offline_source_is_unavailable() -> Result<()> {
    let store = seeded_store();
    let core = core(&store, "No fire detected")?;
    assert!(matches!(
        core.supervisor.start("dark", "fire"),
        Err(ControlError::SourceUnavailable(_))
    ));
    assert!(!core.supervisor.is_running("dark", "fire"));
    assert_eq!(core.registry.state("dark"), SourceState::Failed);
    Ok(())
}

#[test]
fn failing_source_turns_unhealthy_and_stops_worker() -> Result<()> {
    let store = seeded_store();
    let core = core(&store, "No fire detected")?;
    core.supervisor.start("flaky", "fire")?;

    assert!(wait_until(Duration::from_secs(10), || {
        !core.supervisor.is_running("flaky", "fire")
    }));
    assert!(!core.registry.is_healthy("flaky"));
    assert_eq!(core.registry.state("flaky"), SourceState::Unhealthy);
    let failed = core
        .events
        .since(0)
        .into_iter()
        .find(|e| e.kind() == EventKind::SourceFailed)
        .expect("source_failed event");
    assert_eq!(failed.data()["camera_id"], "flaky");
    assert_eq!(failed.data()["consecutive_errors"], 3);

    // Release and re-acquire recovers the handle.
    core.registry.release("flaky");
    core.registry.acquire("flaky", "stub://flaky?fail_after=5")?;
    assert!(core.registry.is_healthy("flaky"));
    core.shutdown();
    Ok(())
}
