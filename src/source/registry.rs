use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::transport::{FrameReader, Transport};
use super::{
    default_transports, CaptureSettings, SourceState, SourceUri, DEFAULT_ERROR_THRESHOLD,
    DEFAULT_RESTART_PAUSE,
};
use crate::error::SourceError;
use crate::frame::{now_ms, Frame, CAPTURE_JPEG_QUALITY};
use crate::validate_id;

/// One open (or failed, or closed) source.
///
/// The reader mutex is the per-source exclusive-access lock: every read, and
/// the close on release, happens under it.
pub struct SourceHandle {
    id: String,
    uri: String,
    transport: &'static str,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    state: Mutex<SourceState>,
    error_threshold: u32,
    consecutive_errors: AtomicU32,
    frames_read: AtomicU64,
    last_read_ms: AtomicU64,
    opened_at_ms: u64,
}

impl SourceHandle {
    fn new(
        id: &str,
        uri: &str,
        transport: &'static str,
        reader: Option<Box<dyn FrameReader>>,
        state: SourceState,
        error_threshold: u32,
    ) -> Self {
        Self {
            id: id.to_string(),
            uri: uri.to_string(),
            transport,
            reader: Mutex::new(reader),
            state: Mutex::new(state),
            error_threshold: error_threshold.max(1),
            consecutive_errors: AtomicU32::new(0),
            frames_read: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(0),
            opened_at_ms: now_ms(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The URI that actually opened (the fallback, if the primary failed).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SourceState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            log::debug!("source {}: {} -> {}", self.id, *state, next);
            *state = next;
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::SeqCst)
    }

    pub fn last_read_ms(&self) -> Option<u64> {
        match self.last_read_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<Box<dyn FrameReader>>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One blocking read under the handle lock.
    pub fn read(&self) -> Result<Frame, SourceError> {
        let mut reader = self.lock_reader();
        match self.state() {
            SourceState::Unhealthy => {
                return Err(SourceError::Terminal {
                    id: self.id.clone(),
                    errors: self.consecutive_errors(),
                })
            }
            state if !state.is_readable() => return Err(SourceError::NotAcquired(self.id.clone())),
            _ => {}
        }
        let Some(reader) = reader.as_mut() else {
            return Err(SourceError::NotAcquired(self.id.clone()));
        };

        match reader.read() {
            Ok(frame) => {
                self.consecutive_errors.store(0, Ordering::SeqCst);
                self.frames_read.fetch_add(1, Ordering::SeqCst);
                self.last_read_ms.store(now_ms(), Ordering::SeqCst);
                if self.state() == SourceState::Open {
                    self.set_state(SourceState::Streaming);
                }
                Ok(frame)
            }
            Err(err) => {
                let errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                if errors >= self.error_threshold {
                    self.set_state(SourceState::Unhealthy);
                    log::error!(
                        "source {} unhealthy after {} consecutive read errors: {:#}",
                        self.id,
                        errors,
                        err
                    );
                } else {
                    log::debug!("source {} read error {}: {:#}", self.id, errors, err);
                }
                Err(SourceError::Read {
                    id: self.id.clone(),
                    reason: format!("{:#}", err),
                })
            }
        }
    }

    /// Close the connection. Waits for an in-flight read to finish.
    fn close(&self) {
        let mut reader = self.lock_reader();
        if let Some(mut r) = reader.take() {
            r.close();
        }
        self.set_state(SourceState::Closed);
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            id: self.id.clone(),
            uri: self.uri.clone(),
            transport: self.transport,
            state: self.state(),
            consecutive_errors: self.consecutive_errors(),
            frames_read: self.frames_read(),
            last_read_ms: self.last_read_ms(),
            opened_at_ms: self.opened_at_ms,
        }
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of a handle.
#[derive(Clone, Debug, Serialize)]
pub struct SourceSnapshot {
    pub id: String,
    pub uri: String,
    pub transport: &'static str,
    pub state: SourceState,
    pub consecutive_errors: u32,
    pub frames_read: u64,
    pub last_read_ms: Option<u64>,
    pub opened_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum ProbeOutcome {
    Opened,
    OpenedNoFrame,
    FailedToOpen(String),
    Unsupported,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProbeReport {
    pub transport: &'static str,
    pub outcome: ProbeOutcome,
}

/// Per-source registry entry. `gate` serializes opens of one source;
/// `current` is only ever held briefly, so lookups never wait on an open.
#[derive(Default)]
struct Slot {
    gate: Mutex<()>,
    current: Mutex<Option<Arc<SourceHandle>>>,
}

impl Slot {
    fn current(&self) -> MutexGuard<'_, Option<Arc<SourceHandle>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self) -> Option<Arc<SourceHandle>> {
        self.current().clone()
    }

    fn take(&self) -> Option<Arc<SourceHandle>> {
        self.current().take()
    }
}

/// Owner of every source handle.
///
/// The outer map lock only guards slot lookup. Opening, reading and closing
/// happen under the per-source slot or handle locks, so a slow camera never
/// blocks work on another.
pub struct SourceRegistry {
    transports: Vec<Arc<dyn Transport>>,
    settings: CaptureSettings,
    fallback_uri: Option<String>,
    error_threshold: u32,
    restart_pause: Duration,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(default_transports(), CaptureSettings::default())
    }
}

impl SourceRegistry {
    pub fn new(transports: Vec<Arc<dyn Transport>>, settings: CaptureSettings) -> Self {
        Self {
            transports,
            settings,
            fallback_uri: None,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            restart_pause: DEFAULT_RESTART_PAUSE,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// URI tried through the same transport chain when the primary fails.
    pub fn with_fallback(mut self, uri: Option<String>) -> Self {
        self.fallback_uri = uri.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        self.slots().entry(id.to_string()).or_default().clone()
    }

    /// Current handle for `id` in whatever state it is in.
    pub fn handle(&self, id: &str) -> Option<Arc<SourceHandle>> {
        let slot = self.slots().get(id).cloned()?;
        slot.get()
    }

    /// Open the source unless a live handle already exists.
    pub fn acquire(&self, id: &str, uri: &str) -> Result<Arc<SourceHandle>, SourceError> {
        if !validate_id(id) {
            return Err(SourceError::InvalidId(id.to_string()));
        }
        loop {
            let slot = self.slot(id);
            let _gate = slot.gate.lock().unwrap_or_else(|e| e.into_inner());
            // Released between lookup and gate: start over on a fresh slot.
            if !self.owns_slot(id, &slot) {
                continue;
            }
            return self.acquire_gated(id, uri, &slot);
        }
    }

    fn owns_slot(&self, id: &str, slot: &Arc<Slot>) -> bool {
        self.slots()
            .get(id)
            .map(|s| Arc::ptr_eq(s, slot))
            .unwrap_or(false)
    }

    /// Body of `acquire`; the caller holds `slot.gate`.
    fn acquire_gated(
        &self,
        id: &str,
        uri: &str,
        slot: &Arc<Slot>,
    ) -> Result<Arc<SourceHandle>, SourceError> {
        if let Some(handle) = slot.get() {
            if !matches!(handle.state(), SourceState::Closed | SourceState::Failed) {
                return Ok(handle);
            }
        }

        log::info!("opening source {} ({})", id, uri);
        let placeholder = Arc::new(SourceHandle::new(
            id,
            uri,
            "none",
            None,
            SourceState::Opening,
            self.error_threshold,
        ));
        *slot.current() = Some(placeholder.clone());

        let opened = self.open_candidates(id, uri);

        // Release removes the slot from the map before emptying it.
        let slot_registered = self.owns_slot(id, slot);
        let mut current = slot.current();
        let still_registered = slot_registered
            && current
                .as_ref()
                .map(|h| Arc::ptr_eq(h, &placeholder))
                .unwrap_or(false);
        match opened {
            Ok((opened_uri, transport, mut reader)) => {
                if !still_registered {
                    reader.close();
                    return Err(SourceError::Unavailable {
                        id: id.to_string(),
                        reason: "released while opening".to_string(),
                    });
                }
                let handle = Arc::new(SourceHandle::new(
                    id,
                    &opened_uri,
                    transport,
                    Some(reader),
                    SourceState::Open,
                    self.error_threshold,
                ));
                log::info!("source {} open via {} ({})", id, transport, opened_uri);
                *current = Some(handle.clone());
                Ok(handle)
            }
            Err(reason) => {
                if still_registered {
                    *current = Some(Arc::new(SourceHandle::new(
                        id,
                        uri,
                        "none",
                        None,
                        SourceState::Failed,
                        self.error_threshold,
                    )));
                }
                log::error!("source {} unavailable: {}", id, reason);
                Err(SourceError::Unavailable {
                    id: id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Primary URI, then the fallback, each through the whole chain.
    fn open_candidates(
        &self,
        id: &str,
        uri: &str,
    ) -> Result<(String, &'static str, Box<dyn FrameReader>), String> {
        let mut candidates = vec![uri];
        if let Some(fallback) = self.fallback_uri.as_deref() {
            if fallback != uri {
                candidates.push(fallback);
            }
        }
        let mut reasons = Vec::new();
        for candidate in candidates {
            if candidate != uri {
                log::warn!("source {}: trying fallback {}", id, candidate);
            }
            if let Some((transport, reader)) = self.open_chain(candidate, &mut reasons) {
                return Ok((candidate.to_string(), transport, reader));
            }
        }
        if reasons.is_empty() {
            Err("no transport supports this uri".to_string())
        } else {
            Err(reasons.join("; "))
        }
    }

    fn open_chain(
        &self,
        uri: &str,
        reasons: &mut Vec<String>,
    ) -> Option<(&'static str, Box<dyn FrameReader>)> {
        let parsed = match SourceUri::parse(uri) {
            Ok(parsed) => parsed,
            Err(err) => {
                reasons.push(format!("{}: {:#}", uri, err));
                return None;
            }
        };
        for transport in self.transports.iter().filter(|t| t.supports(&parsed)) {
            let mut reader = match transport.open(&parsed, &self.settings) {
                Ok(reader) => reader,
                Err(err) => {
                    reasons.push(format!("{} via {}: {:#}", uri, transport.name(), err));
                    continue;
                }
            };
            if self.settings.probe_on_open {
                if let Err(err) = reader.read() {
                    reasons.push(format!(
                        "{} via {}: no test frame: {:#}",
                        uri,
                        transport.name(),
                        err
                    ));
                    reader.close();
                    continue;
                }
            }
            return Some((transport.name(), reader));
        }
        None
    }

    /// One frame from the source. Concurrent calls on one source serialize.
    pub fn read_frame(&self, id: &str) -> Result<Frame, SourceError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| SourceError::NotAcquired(id.to_string()))?;
        handle.read()
    }

    /// Read one frame and encode it for an operator.
    pub fn capture_jpeg(&self, id: &str) -> Result<Vec<u8>> {
        let frame = self.read_frame(id)?;
        frame.encode_jpeg(CAPTURE_JPEG_QUALITY)
    }

    /// Close the source and forget it. Unknown ids are ignored.
    pub fn release(&self, id: &str) {
        let Some(slot) = self.slots().remove(id) else {
            return;
        };
        if let Some(handle) = slot.take() {
            handle.close();
            log::info!("released source {}", id);
        }
    }

    pub fn release_all(&self) {
        let slots: Vec<(String, Arc<Slot>)> = self.slots().drain().collect();
        for (id, slot) in slots {
            if let Some(handle) = slot.take() {
                handle.close();
                log::info!("released source {}", id);
            }
        }
    }

    /// Release, pause, then open again.
    pub fn restart(&self, id: &str, uri: &str) -> Result<Arc<SourceHandle>, SourceError> {
        log::info!("restarting source {}", id);
        self.release(id);
        thread::sleep(self.restart_pause);
        self.acquire(id, uri)
    }

    /// A handle exists and is open or streaming.
    pub fn is_healthy(&self, id: &str) -> bool {
        self.handle(id)
            .map(|h| h.state().is_readable())
            .unwrap_or(false)
    }

    pub fn state(&self, id: &str) -> SourceState {
        self.handle(id)
            .map(|h| h.state())
            .unwrap_or(SourceState::Unopened)
    }

    /// Try every transport against a URI without registering anything.
    pub fn probe(&self, uri: &str) -> Result<Vec<ProbeReport>> {
        let parsed = SourceUri::parse(uri)?;
        let mut reports = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let outcome = if !transport.supports(&parsed) {
                ProbeOutcome::Unsupported
            } else {
                match transport.open(&parsed, &self.settings) {
                    Err(err) => ProbeOutcome::FailedToOpen(format!("{:#}", err)),
                    Ok(mut reader) => {
                        let outcome = match reader.read() {
                            Ok(_) => ProbeOutcome::Opened,
                            Err(_) => ProbeOutcome::OpenedNoFrame,
                        };
                        reader.close();
                        outcome
                    }
                }
            };
            reports.push(ProbeReport {
                transport: transport.name(),
                outcome,
            });
        }
        Ok(reports)
    }

    /// Snapshots of every registered handle, sorted by id.
    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let mut out: Vec<SourceSnapshot> = slots
            .iter()
            .filter_map(|slot| slot.get().map(|h| h.snapshot()))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicBool;

    /// Transport whose reads can be made to fail on demand and which tracks
    /// how many reads overlap.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub fail_open: AtomicBool,
        pub fail_reads: Arc<AtomicBool>,
        pub opens: AtomicU32,
        pub in_flight: Arc<AtomicU32>,
        pub max_in_flight: Arc<AtomicU32>,
        pub read_delay: Duration,
    }

    impl ScriptedTransport {
        pub fn with_read_delay(delay: Duration) -> Self {
            Self {
                read_delay: delay,
                ..Self::default()
            }
        }
    }

    struct ScriptedReader {
        fail_reads: Arc<AtomicBool>,
        in_flight: Arc<AtomicU32>,
        max_in_flight: Arc<AtomicU32>,
        read_delay: Duration,
    }

    impl Transport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports(&self, uri: &SourceUri) -> bool {
            uri.as_str().starts_with("stub://")
        }

        fn open(&self, uri: &SourceUri, _settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) || uri.as_str().contains("offline") {
                return Err(anyhow!("scripted open failure"));
            }
            Ok(Box::new(ScriptedReader {
                fail_reads: self.fail_reads.clone(),
                in_flight: self.in_flight.clone(),
                max_in_flight: self.max_in_flight.clone(),
                read_delay: self.read_delay,
            }))
        }
    }

    impl FrameReader for ScriptedReader {
        fn read(&mut self) -> Result<Frame> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.read_delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(anyhow!("scripted read failure"));
            }
            Frame::filled(4, 4, [10, 20, 30])
        }
    }

    pub fn registry(transport: Arc<ScriptedTransport>) -> SourceRegistry {
        let settings = CaptureSettings {
            probe_on_open: false,
            ..CaptureSettings::default()
        };
        let transports: Vec<Arc<dyn Transport>> = vec![transport];
        SourceRegistry::new(transports, settings)
            .with_error_threshold(3)
            .with_restart_pause(Duration::from_millis(1))
    }
}
