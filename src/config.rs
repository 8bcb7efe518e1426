use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::identity::{DEFAULT_MATCH_THRESHOLD, DEFAULT_TEMPLATE_DIM};
use crate::pipeline::{IdentitySettings, Intervals, WorkerSettings, DEFAULT_FRAME_STRIDE};
use crate::source::{CaptureSettings, DEFAULT_ERROR_THRESHOLD, DEFAULT_RESTART_PAUSE};
use crate::vision::{
    VisionKeys, DEFAULT_VISION_COOLDOWN, DEFAULT_VISION_ENDPOINT, DEFAULT_VISION_MODEL,
    DEFAULT_VISION_TIMEOUT,
};

const DEFAULT_DB_PATH: &str = "sitewatch.db";
const DEFAULT_PERCEPTION_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct SitewatchConfigFile {
    db_path: Option<String>,
    sources: Option<SourcesConfigFile>,
    workers: Option<WorkersConfigFile>,
    intervals: Option<IntervalsConfigFile>,
    identity: Option<IdentityConfigFile>,
    events: Option<EventsConfigFile>,
    vision: Option<VisionConfigFile>,
    perception: Option<PerceptionConfigFile>,
    assignments: Option<Vec<AssignmentConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct SourcesConfigFile {
    fallback_uri: Option<String>,
    error_threshold: Option<u32>,
    restart_pause_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    buffer_frames: Option<u32>,
    probe_on_open: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkersConfigFile {
    frame_stride: Option<u32>,
    error_pause_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IntervalsConfigFile {
    fire_ms: Option<u64>,
    helmet_ms: Option<u64>,
    activity_ms: Option<u64>,
    attendance_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentityConfigFile {
    match_threshold: Option<f32>,
    template_dim: Option<usize>,
    face_window_ms: Option<u64>,
    attendance_window_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct VisionConfigFile {
    endpoint: Option<String>,
    model: Option<String>,
    timeout_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    fire_key: Option<String>,
    helmet_key: Option<String>,
    activity_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PerceptionConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AssignmentConfigFile {
    source: String,
    pipeline: String,
}

#[derive(Debug, Clone)]
pub struct SitewatchConfig {
    pub db_path: String,
    pub sources: SourceSettings,
    pub workers: WorkerSettings,
    pub intervals: Intervals,
    pub identity: IdentitySettings,
    pub template_dim: usize,
    pub event_capacity: usize,
    pub vision: VisionSettings,
    pub perception: PerceptionSettings,
    /// (source id, pipeline id) pairs started at boot.
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub capture: CaptureSettings,
    pub fallback_uri: Option<String>,
    pub error_threshold: u32,
    pub restart_pause: Duration,
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub keys: VisionKeys,
}

#[derive(Debug, Clone)]
pub struct PerceptionSettings {
    /// Base URL of the perception service; `None` runs the stub backend.
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub source_id: String,
    pub pipeline_id: String,
}

impl Assignment {
    /// Parse `source:pipeline`. The split is on the last colon, since source
    /// ids may themselves contain colons.
    pub fn parse(raw: &str) -> Result<Self> {
        let (source, pipeline) = raw
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("assignment '{}' must look like source:pipeline", raw))?;
        Ok(Self {
            source_id: source.trim().to_string(),
            pipeline_id: pipeline.trim().to_string(),
        })
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl SitewatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SITEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load an explicit file (or none), then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SitewatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let src = file.sources.unwrap_or_default();
        let capture_defaults = CaptureSettings::default();
        let sources = SourceSettings {
            capture: CaptureSettings {
                buffer_frames: src.buffer_frames.unwrap_or(capture_defaults.buffer_frames),
                width: src.width.unwrap_or(capture_defaults.width),
                height: src.height.unwrap_or(capture_defaults.height),
                fps: src.fps.unwrap_or(capture_defaults.fps),
                probe_on_open: src.probe_on_open.unwrap_or(capture_defaults.probe_on_open),
            },
            fallback_uri: src.fallback_uri.filter(|uri| !uri.trim().is_empty()),
            error_threshold: src.error_threshold.unwrap_or(DEFAULT_ERROR_THRESHOLD),
            restart_pause: millis(src.restart_pause_ms, DEFAULT_RESTART_PAUSE),
        };

        let w = file.workers.unwrap_or_default();
        let worker_defaults = WorkerSettings::default();
        let workers = WorkerSettings {
            frame_stride: w.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
            error_pause: millis(w.error_pause_ms, worker_defaults.error_pause),
            backoff_initial: millis(w.backoff_initial_ms, worker_defaults.backoff_initial),
            backoff_max: millis(w.backoff_max_ms, worker_defaults.backoff_max),
        };

        let iv = file.intervals.unwrap_or_default();
        let interval_defaults = Intervals::default();
        let intervals = Intervals {
            fire: millis(iv.fire_ms, interval_defaults.fire),
            helmet: millis(iv.helmet_ms, interval_defaults.helmet),
            activity: millis(iv.activity_ms, interval_defaults.activity),
            attendance: millis(iv.attendance_ms, interval_defaults.attendance),
        };

        let id = file.identity.unwrap_or_default();
        let identity_defaults = IdentitySettings::default();
        let identity = IdentitySettings {
            match_threshold: id.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD),
            face_window: millis(id.face_window_ms, identity_defaults.face_window),
            attendance_window: millis(id.attendance_window_ms, identity_defaults.attendance_window),
        };

        let v = file.vision.unwrap_or_default();
        let vision = VisionSettings {
            endpoint: v
                .endpoint
                .unwrap_or_else(|| DEFAULT_VISION_ENDPOINT.to_string()),
            model: v.model.unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            timeout: millis(v.timeout_ms, DEFAULT_VISION_TIMEOUT),
            cooldown: millis(v.cooldown_ms, DEFAULT_VISION_COOLDOWN),
            keys: VisionKeys {
                fire: v.fire_key,
                helmet: v.helmet_key,
                activity: v.activity_key,
            },
        };

        let p = file.perception.unwrap_or_default();
        let perception = PerceptionSettings {
            url: p.url.filter(|url| !url.trim().is_empty()),
            timeout: Duration::from_millis(p.timeout_ms.unwrap_or(DEFAULT_PERCEPTION_TIMEOUT_MS)),
        };

        let assignments = file
            .assignments
            .unwrap_or_default()
            .into_iter()
            .map(|a| Assignment {
                source_id: a.source,
                pipeline_id: a.pipeline,
            })
            .collect();

        Ok(Self {
            db_path,
            sources,
            workers,
            intervals,
            identity,
            template_dim: id.template_dim.unwrap_or(DEFAULT_TEMPLATE_DIM),
            event_capacity: file
                .events
                .and_then(|events| events.capacity)
                .unwrap_or(DEFAULT_EVENT_CAPACITY),
            vision,
            perception,
            assignments,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("SITEWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(uri) = env_nonempty("SITEWATCH_FALLBACK_URI") {
            self.sources.fallback_uri = Some(uri);
        }
        if let Some(stride) = env_nonempty("SITEWATCH_FRAME_STRIDE") {
            self.workers.frame_stride = stride
                .parse()
                .map_err(|_| anyhow!("SITEWATCH_FRAME_STRIDE must be a positive integer"))?;
        }
        if let Some(threshold) = env_nonempty("SITEWATCH_ERROR_THRESHOLD") {
            self.sources.error_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("SITEWATCH_ERROR_THRESHOLD must be a positive integer"))?;
        }
        if let Some(capacity) = env_nonempty("SITEWATCH_EVENT_CAPACITY") {
            self.event_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("SITEWATCH_EVENT_CAPACITY must be a positive integer"))?;
        }
        if let Some(url) = env_nonempty("SITEWATCH_PERCEPTION_URL") {
            self.perception.url = Some(url);
        }
        if let Some(url) = env_nonempty("SITEWATCH_VISION_URL") {
            self.vision.endpoint = url;
        }
        if let Some(key) = env_nonempty("GOOGLE_API_KEY_FIRE") {
            self.vision.keys.fire = Some(key);
        }
        if let Some(key) = env_nonempty("GOOGLE_API_KEY_HELMET") {
            self.vision.keys.helmet = Some(key);
        }
        if let Some(key) = env_nonempty("GOOGLE_API_KEY_ACTIVITY") {
            self.vision.keys.activity = Some(key);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.workers.frame_stride == 0 {
            return Err(anyhow!("frame_stride must be greater than zero"));
        }
        if self.workers.error_pause.is_zero() {
            return Err(anyhow!("error_pause_ms must be greater than zero"));
        }
        if self.workers.backoff_initial.is_zero() {
            return Err(anyhow!("backoff_initial_ms must be greater than zero"));
        }
        if self.workers.backoff_max < self.workers.backoff_initial {
            return Err(anyhow!("backoff_max_ms must not be below backoff_initial_ms"));
        }
        if self.sources.error_threshold == 0 {
            return Err(anyhow!("error_threshold must be greater than zero"));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event capacity must be greater than zero"));
        }
        if self.sources.capture.width == 0 || self.sources.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.template_dim == 0 {
            return Err(anyhow!("template_dim must be greater than zero"));
        }
        let threshold = self.identity.match_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(anyhow!("match_threshold must be a positive number"));
        }
        if let Some(url) = &self.perception.url {
            let parsed = url::Url::parse(url)
                .map_err(|e| anyhow!("invalid perception url {}: {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("perception url must be http(s): {}", url));
            }
        }
        for assignment in &self.assignments {
            if !crate::validate_id(&assignment.source_id) || !crate::validate_id(&assignment.pipeline_id) {
                return Err(anyhow!(
                    "assignment {}:{} has an invalid id",
                    assignment.source_id,
                    assignment.pipeline_id
                ));
            }
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SitewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_splits_on_last_colon() -> Result<()> {
        let a = Assignment::parse("site:gate-1:fire")?;
        assert_eq!(a.source_id, "site:gate-1");
        assert_eq!(a.pipeline_id, "fire");
        assert!(Assignment::parse("nocolon").is_err());
        Ok(())
    }

    #[test]
    fn empty_file_gives_defaults() -> Result<()> {
        let cfg = SitewatchConfig::from_file(SitewatchConfigFile::default())?;
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.workers.frame_stride, 30);
        assert_eq!(cfg.sources.error_threshold, 10);
        assert_eq!(cfg.sources.capture.width, 640);
        assert_eq!(cfg.intervals.fire, Duration::from_secs(3));
        assert_eq!(cfg.identity.attendance_window, Duration::from_secs(10));
        assert_eq!(cfg.event_capacity, 100);
        assert_eq!(cfg.vision.cooldown, Duration::from_millis(500));
        assert!(cfg.perception.url.is_none());
        Ok(())
    }

    #[test]
    fn validation_rejects_zero_stride() -> Result<()> {
        let mut cfg = SitewatchConfig::from_file(SitewatchConfigFile::default())?;
        cfg.workers.frame_stride = 0;
        assert!(cfg.validate().is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_zero_pauses() -> Result<()> {
        let mut cfg = SitewatchConfig::from_file(SitewatchConfigFile::default())?;
        cfg.workers.backoff_initial = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_initial_ms"));

        let mut cfg = SitewatchConfig::from_file(SitewatchConfigFile::default())?;
        cfg.workers.error_pause = Duration::ZERO;
        assert!(cfg.validate().is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_assignment_ids() -> Result<()> {
        let mut cfg = SitewatchConfig::from_file(SitewatchConfigFile::default())?;
        cfg.assignments.push(Assignment {
            source_id: "cam 1".to_string(),
            pipeline_id: "fire".to_string(),
        });
        assert!(cfg.validate().is_err());
        Ok(())
    }
}
