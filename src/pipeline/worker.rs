use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Outcome, Pipeline};
use crate::error::SourceError;
use crate::events::{EventKind, EventLog};
use crate::source::SourceRegistry;

/// Only every Nth successfully read frame reaches the pipeline.
pub const DEFAULT_FRAME_STRIDE: u32 = 30;

const STOP_POLL: Duration = Duration::from_millis(50);

/// Floor for the backoff base so retries always pause.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub frame_stride: u32,
    /// Pause after a pipeline error.
    pub error_pause: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            frame_stride: DEFAULT_FRAME_STRIDE,
            error_pause: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Jittered exponential delay for consecutive read failures.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_BACKOFF);
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Upper bound for the current attempt, before jitter.
    fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay for the next retry: uniformly in [ceiling/2, ceiling].
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Counters a worker publishes while it runs.
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_read: AtomicU64,
    frames_sampled: AtomicU64,
    read_failures: AtomicU64,
    pipeline_errors: AtomicU64,
    events: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub read_failures: u64,
    pub pipeline_errors: u64,
    pub events: u64,
}

impl WorkerStats {
    pub fn counters(&self) -> WorkerCounters {
        WorkerCounters {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_sampled: self.frames_sampled.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            pipeline_errors: self.pipeline_errors.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Loop for one (source, pipeline) pair.
pub struct PipelineWorker {
    source_id: String,
    pipeline_id: String,
    uri: String,
    registry: Arc<SourceRegistry>,
    pipeline: Box<dyn Pipeline>,
    events: Arc<EventLog>,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    settings: WorkerSettings,
}

impl PipelineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: &str,
        pipeline_id: &str,
        uri: &str,
        registry: Arc<SourceRegistry>,
        pipeline: Box<dyn Pipeline>,
        events: Arc<EventLog>,
        running: Arc<AtomicBool>,
        stats: Arc<WorkerStats>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            uri: uri.to_string(),
            registry,
            pipeline,
            events,
            running,
            stats,
            settings,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep up to `total`, waking early once the worker is stopped.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    /// Run until stopped or the source turns terminal. Never releases the source.
    pub fn run(mut self) {
        let stride = self.settings.frame_stride.max(1) as u64;
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut counter: u64 = 0;
        log::info!(
            "worker {}/{} ({}) started",
            self.source_id,
            self.pipeline_id,
            self.pipeline.kind()
        );

        while self.is_running() {
            let frame = match self.registry.read_frame(&self.source_id) {
                Ok(frame) => frame,
                Err(SourceError::NotAcquired(_)) => {
                    log::info!("worker {}/{}: re-acquiring source", self.source_id, self.pipeline_id);
                    if let Err(err) = self.registry.acquire(&self.source_id, &self.uri) {
                        log::warn!(
                            "worker {}/{}: re-acquire failed: {}",
                            self.source_id,
                            self.pipeline_id,
                            err
                        );
                        self.pause(backoff.next_delay());
                    }
                    continue;
                }
                Err(err) if err.is_terminal() => {
                    log::error!("worker {}/{}: {}", self.source_id, self.pipeline_id, err);
                    let errors = match &err {
                        SourceError::Terminal { errors, .. } => *errors,
                        _ => 0,
                    };
                    self.events.append(
                        EventKind::SourceFailed,
                        json!({
                            "camera_id": self.source_id,
                            "pipeline_id": self.pipeline_id,
                            "consecutive_errors": errors,
                            "message": err.to_string(),
                        }),
                    );
                    break;
                }
                Err(err) => {
                    self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::debug!("worker {}/{}: {}", self.source_id, self.pipeline_id, err);
                    self.pause(backoff.next_delay());
                    continue;
                }
            };
            backoff.reset();
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);

            counter += 1;
            if counter % stride != 0 {
                continue;
            }
            self.stats.frames_sampled.fetch_add(1, Ordering::Relaxed);

            match self.pipeline.process(&frame, Instant::now()) {
                Ok(Outcome::Completed { events }) => {
                    self.stats
                        .events
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(err) => {
                    self.stats.pipeline_errors.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "worker {}/{} ({}) pipeline error: {:#}",
                        self.source_id,
                        self.pipeline_id,
                        self.pipeline.kind(),
                        err
                    );
                    self.pause(self.settings.error_pause);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("worker {}/{} stopped", self.source_id, self.pipeline_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::pipeline::PipelineKind;
    use crate::source::registry::testing::{registry, ScriptedTransport};
    use anyhow::{anyhow, Result};
    use std::sync::Mutex;

    struct Recording {
        seen: Arc<Mutex<u32>>,
        fail: bool,
    }

    impl Pipeline for Recording {
        fn kind(&self) -> PipelineKind {
            PipelineKind::Fire
        }

        fn process(&mut self, _frame: &Frame, _now: Instant) -> Result<Outcome> {
            *self.seen.lock().unwrap() += 1;
            if self.fail {
                return Err(anyhow!("scripted failure"));
            }
            Ok(Outcome::Completed { events: vec![] })
        }
    }

    fn settings(stride: u32) -> WorkerSettings {
        WorkerSettings {
            frame_stride: stride,
            error_pause: Duration::from_millis(1),
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800));
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(800));
            assert!(delay >= Duration::from_millis(50));
        }
        assert_eq!(backoff.ceiling(), Duration::from_millis(800));
        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn zero_backoff_still_pauses() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.ceiling(), MIN_BACKOFF);
        assert!(backoff.next_delay() >= MIN_BACKOFF);
    }

    #[test]
    fn samples_every_nth_frame_and_stops_cooperatively() -> Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(registry(transport));
        registry.acquire("cam1", "stub://cam1")?;

        let seen = Arc::new(Mutex::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkerStats::default());
        let worker = PipelineWorker::new(
            "cam1",
            "p1",
            "stub://cam1",
            registry.clone(),
            Box::new(Recording {
                seen: seen.clone(),
                fail: false,
            }),
            Arc::new(EventLog::default()),
            running.clone(),
            stats.clone(),
            settings(5),
        );
        let thread = std::thread::spawn(move || worker.run());

        assert!(wait_until(Duration::from_secs(5), || stats.counters().frames_read >= 20));
        running.store(false, Ordering::SeqCst);
        thread.join().unwrap();

        let counters = stats.counters();
        assert_eq!(counters.frames_sampled, counters.frames_read / 5);
        assert_eq!(*seen.lock().unwrap() as u64, counters.frames_sampled);
        assert!(registry.is_healthy("cam1"));
        Ok(())
    }

    #[test]
    fn pipeline_errors_do_not_end_the_loop() -> Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(registry(transport));
        registry.acquire("cam1", "stub://cam1")?;

        let seen = Arc::new(Mutex::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkerStats::default());
        let worker = PipelineWorker::new(
            "cam1",
            "p1",
            "stub://cam1",
            registry,
            Box::new(Recording {
                seen: seen.clone(),
                fail: true,
            }),
            Arc::new(EventLog::default()),
            running.clone(),
            stats.clone(),
            settings(1),
        );
        let thread = std::thread::spawn(move || worker.run());

        assert!(wait_until(Duration::from_secs(5), || stats.counters().pipeline_errors >= 3));
        assert!(running.load(Ordering::SeqCst));
        running.store(false, Ordering::SeqCst);
        thread.join().unwrap();
        Ok(())
    }

    #[test]
    fn terminal_source_ends_worker_with_event() -> Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(registry(transport.clone()));
        registry.acquire("cam1", "stub://cam1")?;
        transport.fail_reads.store(true, Ordering::SeqCst);

        let events = Arc::new(EventLog::default());
        let running = Arc::new(AtomicBool::new(true));
        let worker = PipelineWorker::new(
            "cam1",
            "p1",
            "stub://cam1",
            registry.clone(),
            Box::new(Recording {
                seen: Arc::new(Mutex::new(0)),
                fail: false,
            }),
            events.clone(),
            running.clone(),
            Arc::new(WorkerStats::default()),
            settings(1),
        );
        let thread = std::thread::spawn(move || worker.run());

        assert!(wait_until(Duration::from_secs(5), || !running.load(Ordering::SeqCst)));
        thread.join().unwrap();
        assert!(!registry.is_healthy("cam1"));
        let last = &events.latest(1)[0];
        assert_eq!(last.kind(), EventKind::SourceFailed);
        assert_eq!(last.data()["consecutive_errors"], 3);
        Ok(())
    }

    #[test]
    fn released_source_is_reacquired() -> Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(registry(transport.clone()));

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkerStats::default());
        let worker = PipelineWorker::new(
            "cam1",
            "p1",
            "stub://cam1",
            registry.clone(),
            Box::new(Recording {
                seen: Arc::new(Mutex::new(0)),
                fail: false,
            }),
            Arc::new(EventLog::default()),
            running.clone(),
            stats.clone(),
            settings(1),
        );
        let thread = std::thread::spawn(move || worker.run());

        assert!(wait_until(Duration::from_secs(5), || stats.counters().frames_read > 0));
        registry.release("cam1");
        let before = stats.counters().frames_read;
        assert!(wait_until(Duration::from_secs(5), || stats.counters().frames_read > before + 2));
        running.store(false, Ordering::SeqCst);
        thread.join().unwrap();
        assert!(transport.opens.load(Ordering::SeqCst) >= 2);
        Ok(())
    }
}
