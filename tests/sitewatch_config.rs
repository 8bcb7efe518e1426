use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use sitewatch::config::SitewatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SITEWATCH_CONFIG",
        "SITEWATCH_DB_PATH",
        "SITEWATCH_FALLBACK_URI",
        "SITEWATCH_FRAME_STRIDE",
        "SITEWATCH_ERROR_THRESHOLD",
        "SITEWATCH_EVENT_CAPACITY",
        "SITEWATCH_PERCEPTION_URL",
        "SITEWATCH_VISION_URL",
        "GOOGLE_API_KEY_FIRE",
        "GOOGLE_API_KEY_HELMET",
        "GOOGLE_API_KEY_ACTIVITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_toml_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        db_path = "site_prod.db"

        [sources]
        fallback_uri = "0"
        error_threshold = 4
        width = 800
        height = 600

        [workers]
        frame_stride = 15

        [intervals]
        fire_ms = 1500

        [identity]
        match_threshold = 0.5
        attendance_window_ms = 20000

        [events]
        capacity = 250

        [vision]
        fire_key = "from-file"

        [[assignments]]
        source = "gate-1"
        pipeline = "fire"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("SITEWATCH_CONFIG", file.path());
    std::env::set_var("SITEWATCH_FRAME_STRIDE", "10");
    std::env::set_var("GOOGLE_API_KEY_HELMET", "helmet-key");
    std::env::set_var("SITEWATCH_PERCEPTION_URL", "http://127.0.0.1:8601");

    let cfg = SitewatchConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "site_prod.db");
    assert_eq!(cfg.sources.fallback_uri.as_deref(), Some("0"));
    assert_eq!(cfg.sources.error_threshold, 4);
    assert_eq!(cfg.sources.capture.width, 800);
    assert_eq!(cfg.sources.capture.height, 600);
    assert_eq!(cfg.workers.frame_stride, 10);
    assert_eq!(cfg.intervals.fire, Duration::from_millis(1500));
    assert_eq!(cfg.intervals.helmet, Duration::from_secs(5));
    assert_eq!(cfg.identity.match_threshold, 0.5);
    assert_eq!(cfg.identity.attendance_window, Duration::from_secs(20));
    assert_eq!(cfg.event_capacity, 250);
    assert_eq!(cfg.vision.keys.fire.as_deref(), Some("from-file"));
    assert_eq!(cfg.vision.keys.helmet.as_deref(), Some("helmet-key"));
    assert!(cfg.vision.keys.activity.is_none());
    assert_eq!(cfg.perception.url.as_deref(), Some("http://127.0.0.1:8601"));
    assert_eq!(cfg.assignments.len(), 1);
    assert_eq!(cfg.assignments[0].source_id, "gate-1");

    clear_env();
}

#[test]
fn loads_json_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    file.write_all(br#"{"db_path": "json.db", "workers": {"error_pause_ms": 250}}"#)
        .expect("write config");

    let cfg = SitewatchConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "json.db");
    assert_eq!(cfg.workers.error_pause, Duration::from_millis(250));
    assert_eq!(cfg.workers.frame_stride, 30);

    clear_env();
}

#[test]
fn rejects_non_numeric_env_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SITEWATCH_ERROR_THRESHOLD", "many");
    assert!(SitewatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_zero_event_capacity() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SITEWATCH_EVENT_CAPACITY", "0");
    let err = SitewatchConfig::load().unwrap_err();
    assert!(err.to_string().contains("capacity"));

    clear_env();
}

#[test]
fn rejects_non_http_perception_url() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SITEWATCH_PERCEPTION_URL", "ftp://sidecar");
    assert!(SitewatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_zero_backoff_in_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    file.write_all(br#"{"workers": {"backoff_initial_ms": 0}}"#)
        .expect("write config");
    let err = SitewatchConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("backoff_initial_ms"));

    clear_env();
}
