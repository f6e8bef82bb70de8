use std::io::Write;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tempfile::NamedTempFile;

use lpr_edge::config::{AppConfig, ConfigError, ConfigWatcher};
use lpr_edge::pipeline::DropPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "LPR_CONFIG",
        "LPR_STREAM_URL",
        "LPR_CAMERA_ID",
        "LPR_AI_HOST",
        "LPR_TELEMETRY_ADDR",
        "LPR_TARGET_FPS",
        "LPR_DROP_POLICY",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(json.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "stream": {
                "url": "http://10.0.0.5/video.mjpg",
                "camera_id": "NORTH_GATE",
                "fps_cap": 12,
                "reconnect_delay_ms": 250,
                "max_reconnect_attempts": 5
            },
            "ai_service": {
                "host": "http://10.0.0.9:8000",
                "timeout_ms": 3000,
                "retry_count": 2
            },
            "pipeline": {
                "queue_size": 64,
                "max_inference_queue": 4,
                "drop_policy": "drop_newest"
            },
            "preprocessing": {
                "target_width": 960,
                "target_height": 540,
                "quality_threshold": 0.45,
                "quality_weights": { "sharpness": 0.6 }
            },
            "health": { "port": 9100 }
        }"#,
    );

    std::env::set_var("LPR_CONFIG", file.path());
    std::env::set_var("LPR_CAMERA_ID", "SOUTH_GATE");
    std::env::set_var("LPR_DROP_POLICY", "block");

    let cfg = AppConfig::load().expect("load config");

    assert_eq!(cfg.stream.url, "http://10.0.0.5/video.mjpg");
    assert_eq!(cfg.stream.camera_id, "SOUTH_GATE");
    assert_eq!(cfg.stream.target_fps, 12);
    assert_eq!(cfg.stream.reconnect_delay, Duration::from_millis(250));
    assert_eq!(cfg.stream.max_reconnect_attempts, Some(5));
    assert_eq!(cfg.ai_service.host, "http://10.0.0.9:8000");
    assert_eq!(cfg.ai_service.timeout, Duration::from_secs(3));
    assert_eq!(cfg.ai_service.retry_count, 2);
    assert_eq!(cfg.pipeline.frame_queue_capacity, 64);
    assert_eq!(cfg.pipeline.inference_queue_capacity, 4);
    assert_eq!(cfg.pipeline.drop_policy, DropPolicy::Block);
    assert_eq!(cfg.preprocessing.target_width, 960);
    assert!((cfg.preprocessing.quality_threshold - 0.45).abs() < 1e-9);
    assert!((cfg.preprocessing.quality_weights.sharpness - 0.6).abs() < 1e-9);
    assert!((cfg.preprocessing.quality_weights.brightness - 0.3).abs() < 1e-9);
    assert_eq!(cfg.telemetry.addr, "0.0.0.0:9100");

    clear_env();
}

#[test]
fn missing_file_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = AppConfig::load().expect("defaults");
    assert_eq!(cfg, AppConfig::default());
    assert_eq!(cfg.stream.target_fps, 15);
    assert_eq!(cfg.pipeline.drop_policy, DropPolicy::DropOldest);
    assert_eq!(cfg.telemetry.addr, "0.0.0.0:8085");
}

#[test]
fn invalid_values_name_the_field() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "stream": { "url": "ftp://camera/feed" } }"#);
    let err = AppConfig::load_from(Some(file.path())).unwrap_err();
    let config_err = err.downcast_ref::<ConfigError>().expect("ConfigError");
    assert_eq!(config_err.field, "stream.url");

    let file = write_config(r#"{ "pipeline": { "drop_policy": "random" } }"#);
    let err = AppConfig::load_from(Some(file.path())).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>().map(|e| e.field),
        Some("pipeline.drop_policy")
    );

    std::env::set_var("LPR_TARGET_FPS", "fast");
    assert!(AppConfig::load_from(None).is_err());
    clear_env();
}

#[test]
fn malformed_json_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{ \"stream\": ");
    assert!(AppConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn watcher_publishes_valid_reloads_only() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "stream": { "camera_id": "FIRST" } }"#);
    let (tx, rx) = mpsc::channel::<Arc<AppConfig>>();
    let watcher = ConfigWatcher::spawn(file.path().to_path_buf(), Duration::from_millis(50), tx)
        .expect("spawn watcher");

    // Coarse filesystem timestamps need a visible gap between writes.
    std::thread::sleep(Duration::from_millis(1100));
    let invalid = r#"{ "stream": { "target_fps": 0 } }"#;
    std::fs::write(file.path(), invalid).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    std::thread::sleep(Duration::from_millis(1100));
    std::fs::write(file.path(), r#"{ "stream": { "camera_id": "SECOND" } }"#).unwrap();
    let reloaded = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("reloaded config");
    assert_eq!(reloaded.stream.camera_id, "SECOND");

    watcher.stop();
}
