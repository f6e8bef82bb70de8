//! Daemon configuration.
//!
//! Configuration is resolved once into an immutable `AppConfig` snapshot:
//! JSON file (optional) -> environment overrides -> validation. Components get
//! their section by reference or through an `Arc<AppConfig>`; nothing mutates a
//! snapshot after load. A reload produces a new snapshot (see `ConfigWatcher`).

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::condition::QualityWeights;
use crate::ingest::TransportBackend;
use crate::pipeline::DropPolicy;

pub const CONFIG_ENV: &str = "LPR_CONFIG";

const DEFAULT_STREAM_URL: &str = "stub://camera";
const DEFAULT_CAMERA_ID: &str = "CAM01";
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_JITTER_MS: u64 = 1_000;
const DEFAULT_BACKOFF_CAP: u32 = 10;
const DEFAULT_AI_HOST: &str = "http://127.0.0.1:8000";
const DEFAULT_AI_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_FRAME_QUEUE: usize = 32;
const DEFAULT_INFERENCE_QUEUE: usize = 16;
const DEFAULT_TARGET_WIDTH: u32 = 1280;
const DEFAULT_TARGET_HEIGHT: u32 = 720;
const DEFAULT_QUALITY_THRESHOLD: f64 = 0.3;
const DEFAULT_TELEMETRY_ADDR: &str = "0.0.0.0:8085";
const DEFAULT_METRICS_INTERVAL_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// A configuration value was rejected. Raised before any I/O is attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

// ----------------------------------------------------------------------------
// File representation
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    stream: Option<StreamConfigFile>,
    ai_service: Option<AiServiceConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    preprocessing: Option<PreprocessingConfigFile>,
    #[serde(alias = "health")]
    telemetry: Option<TelemetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    camera_id: Option<String>,
    #[serde(alias = "fps_cap")]
    target_fps: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    /// Zero, negative or absent means unbounded.
    max_reconnect_attempts: Option<i64>,
    connect_timeout_ms: Option<u64>,
    max_jitter_ms: Option<u64>,
    backoff_cap: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AiServiceConfigFile {
    host: Option<String>,
    timeout_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    #[serde(alias = "queue_size")]
    frame_queue: Option<usize>,
    #[serde(alias = "max_inference_queue")]
    inference_queue: Option<usize>,
    drop_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PreprocessingConfigFile {
    target_width: Option<u32>,
    target_height: Option<u32>,
    letterbox: Option<bool>,
    gamma: Option<f64>,
    denoise: Option<bool>,
    sharpen: Option<bool>,
    quality_threshold: Option<f64>,
    quality_weights: Option<QualityWeights>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
    bind_address: Option<String>,
    port: Option<u16>,
    metrics_interval_ms: Option<u64>,
}

// ----------------------------------------------------------------------------
// Resolved snapshot
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppConfig {
    pub stream: StreamSettings,
    pub ai_service: AiServiceSettings,
    pub pipeline: PipelineSettings,
    pub preprocessing: PreprocessingSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamSettings {
    pub url: String,
    pub camera_id: String,
    pub target_fps: u32,
    pub reconnect_delay: Duration,
    /// `None` reconnects forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Bound on a single transport open attempt.
    pub connect_timeout: Duration,
    pub max_jitter: Duration,
    /// Cap on the backoff exponent.
    pub backoff_cap: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AiServiceSettings {
    /// Base URL, e.g. `http://127.0.0.1:8000`.
    pub host: String,
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineSettings {
    pub frame_queue_capacity: usize,
    pub inference_queue_capacity: usize,
    pub drop_policy: DropPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PreprocessingSettings {
    pub target_width: u32,
    pub target_height: u32,
    pub letterbox: bool,
    pub gamma: f64,
    pub denoise: bool,
    pub sharpen: bool,
    pub quality_threshold: f64,
    pub quality_weights: QualityWeights,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// `host:port`; port 0 picks an ephemeral port.
    pub addr: String,
    pub metrics_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        AppConfig::default().stream
    }
}

impl Default for AiServiceSettings {
    fn default() -> Self {
        AppConfig::default().ai_service
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        AppConfig::default().pipeline
    }
}

impl Default for PreprocessingSettings {
    fn default() -> Self {
        AppConfig::default().preprocessing
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        AppConfig::default().telemetry
    }
}

impl AppConfig {
    /// Resolve configuration from `LPR_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Resolve configuration from an explicit file (if any) and the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let drop_policy = file_cfg
            .pipeline
            .as_ref()
            .and_then(|pipeline| pipeline.drop_policy.clone());
        let mut cfg = Self::from_file(file_cfg);
        if let Some(policy) = drop_policy {
            cfg.pipeline.drop_policy = policy.parse()?;
        }
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let ai = file.ai_service.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let pre = file.preprocessing.unwrap_or_default();
        let telemetry = file.telemetry.unwrap_or_default();

        let telemetry_addr = telemetry.addr.unwrap_or_else(|| {
            match (telemetry.bind_address, telemetry.port) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => format!("{}:8085", host),
                (None, Some(port)) => format!("0.0.0.0:{}", port),
                (None, None) => DEFAULT_TELEMETRY_ADDR.to_string(),
            }
        });

        Self {
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                camera_id: stream
                    .camera_id
                    .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
                target_fps: stream.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                reconnect_delay: Duration::from_millis(
                    stream
                        .reconnect_delay_ms
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
                ),
                max_reconnect_attempts: stream
                    .max_reconnect_attempts
                    .filter(|attempts| *attempts > 0)
                    .map(|attempts| attempts.min(u32::MAX as i64) as u32),
                connect_timeout: Duration::from_millis(
                    stream
                        .connect_timeout_ms
                        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
                ),
                max_jitter: Duration::from_millis(
                    stream.max_jitter_ms.unwrap_or(DEFAULT_MAX_JITTER_MS),
                ),
                backoff_cap: stream.backoff_cap.unwrap_or(DEFAULT_BACKOFF_CAP),
            },
            ai_service: AiServiceSettings {
                host: ai.host.unwrap_or_else(|| DEFAULT_AI_HOST.to_string()),
                timeout: Duration::from_millis(ai.timeout_ms.unwrap_or(DEFAULT_AI_TIMEOUT_MS)),
                retry_count: ai.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
                retry_delay: Duration::from_millis(
                    ai.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
                ),
                jpeg_quality: ai.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            pipeline: PipelineSettings {
                frame_queue_capacity: pipeline.frame_queue.unwrap_or(DEFAULT_FRAME_QUEUE),
                inference_queue_capacity: pipeline
                    .inference_queue
                    .unwrap_or(DEFAULT_INFERENCE_QUEUE),
                drop_policy: DropPolicy::default(),
            },
            preprocessing: PreprocessingSettings {
                target_width: pre.target_width.unwrap_or(DEFAULT_TARGET_WIDTH),
                target_height: pre.target_height.unwrap_or(DEFAULT_TARGET_HEIGHT),
                letterbox: pre.letterbox.unwrap_or(true),
                gamma: pre.gamma.unwrap_or(1.0),
                denoise: pre.denoise.unwrap_or(false),
                sharpen: pre.sharpen.unwrap_or(false),
                quality_threshold: pre
                    .quality_threshold
                    .unwrap_or(DEFAULT_QUALITY_THRESHOLD),
                quality_weights: pre.quality_weights.unwrap_or_default(),
            },
            telemetry: TelemetrySettings {
                enabled: telemetry.enabled.unwrap_or(true),
                addr: telemetry_addr,
                metrics_interval: Duration::from_millis(
                    telemetry
                        .metrics_interval_ms
                        .unwrap_or(DEFAULT_METRICS_INTERVAL_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("LPR_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(camera_id) = non_empty_env("LPR_CAMERA_ID") {
            self.stream.camera_id = camera_id;
        }
        if let Some(host) = non_empty_env("LPR_AI_HOST") {
            self.ai_service.host = host;
        }
        if let Some(addr) = non_empty_env("LPR_TELEMETRY_ADDR") {
            self.telemetry.addr = addr;
        }
        if let Some(fps) = non_empty_env("LPR_TARGET_FPS") {
            self.stream.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("LPR_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(policy) = non_empty_env("LPR_DROP_POLICY") {
            self.pipeline.drop_policy = policy.parse()?;
        }
        Ok(())
    }

    /// Reject values a running pipeline cannot honour, including a source
    /// scheme that no backend compiled into this build can open.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.validate_with_backends(&crate::ingest::default_backends())
    }

    /// As `validate`, checking the source scheme against `backends`.
    pub fn validate_with_backends(
        &self,
        backends: &[Arc<dyn TransportBackend>],
    ) -> std::result::Result<(), ConfigError> {
        let scheme = crate::ingest::validate_source_url(&self.stream.url)?;
        if !backends.iter().any(|backend| backend.supports(&scheme)) {
            return Err(ConfigError::new(
                "stream.url",
                format!(
                    "no transport backend in this build supports '{}' \
                     (enable the rtsp-ffmpeg or rtsp-gstreamer feature)",
                    scheme
                ),
            ));
        }
        if self.stream.camera_id.trim().is_empty() {
            return Err(ConfigError::new("stream.camera_id", "must not be empty"));
        }
        if self.stream.target_fps == 0 {
            return Err(ConfigError::new("stream.target_fps", "must be greater than zero"));
        }
        if self.stream.connect_timeout.is_zero() {
            return Err(ConfigError::new(
                "stream.connect_timeout_ms",
                "must be greater than zero",
            ));
        }
        if !(self.ai_service.host.starts_with("http://")
            || self.ai_service.host.starts_with("https://"))
        {
            return Err(ConfigError::new(
                "ai_service.host",
                format!("expected http(s) URL, got '{}'", self.ai_service.host),
            ));
        }
        if !(1..=100).contains(&self.ai_service.jpeg_quality) {
            return Err(ConfigError::new("ai_service.jpeg_quality", "must be in 1..=100"));
        }
        if self.pipeline.frame_queue_capacity == 0 {
            return Err(ConfigError::new("pipeline.frame_queue", "must be at least 1"));
        }
        if self.pipeline.inference_queue_capacity == 0 {
            return Err(ConfigError::new("pipeline.inference_queue", "must be at least 1"));
        }
        if self.preprocessing.target_width == 0 || self.preprocessing.target_height == 0 {
            return Err(ConfigError::new(
                "preprocessing.target_width/target_height",
                "must be greater than zero",
            ));
        }
        if !(self.preprocessing.gamma > 0.0) {
            return Err(ConfigError::new("preprocessing.gamma", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.preprocessing.quality_threshold) {
            return Err(ConfigError::new(
                "preprocessing.quality_threshold",
                "must be in 0.0..=1.0",
            ));
        }
        if self.telemetry.enabled && self.telemetry.addr.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(ConfigError::new(
                "telemetry.addr",
                format!("'{}' is not a socket address", self.telemetry.addr),
            ));
        }
        if self.telemetry.metrics_interval.is_zero() {
            return Err(ConfigError::new(
                "telemetry.metrics_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

// ----------------------------------------------------------------------------
// Hot reload
// ----------------------------------------------------------------------------

/// Polls a config file and publishes a new validated snapshot when it changes.
///
/// The watcher never mutates a live snapshot; receivers decide when to restart
/// with the new one.
pub struct ConfigWatcher {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn spawn(
        path: PathBuf,
        poll_interval: Duration,
        updates: Sender<Arc<AppConfig>>,
    ) -> Result<Self> {
        let mut last_modified = modified_at(&path)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);

        let join = std::thread::Builder::new()
            .name("config-watch".into())
            .spawn(move || {
                while !shutdown_thread.load(Ordering::Acquire) {
                    sleep_unless(&shutdown_thread, poll_interval);
                    let current = match modified_at(&path) {
                        Ok(current) => current,
                        Err(err) => {
                            log::warn!("config watch: {}", err);
                            continue;
                        }
                    };
                    if current <= last_modified {
                        continue;
                    }
                    last_modified = current;
                    match AppConfig::load_from(Some(&path)) {
                        Ok(cfg) => {
                            log::info!("config file {} changed; new snapshot ready", path.display());
                            if updates.send(Arc::new(cfg)).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            log::warn!("ignoring invalid config reload: {}", err);
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("config watch thread panicked");
            }
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.halt();
    }
}

fn modified_at(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| anyhow!("failed to stat {}: {}", path.display(), e))
}

fn sleep_unless(flag: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !flag.load(Ordering::Acquire) {
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
