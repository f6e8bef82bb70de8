//! Stream ingestion.
//!
//! `StreamIngestor` owns one capture thread that connects to a media URL,
//! paces frames to the target rate and hands each one to a `FrameSink`. On any
//! read failure it drops the connection and reconnects with exponential backoff.
//!
//! Connection lifecycle:
//! Disconnected -> Connecting -> Connected -> (read failure) Disconnected ->
//! backoff -> Connecting ...
//! The thread ends only on `stop()` or when the reconnect cap is exceeded.
//!
//! The ingestor MUST NOT:
//! - Emit a frame from a failed or partial read
//! - Block `stop()` for longer than one backoff slice or one frame read

pub mod backend;
pub mod backoff;
#[cfg(feature = "rtsp-ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;
pub mod mjpeg;
pub mod synthetic;

pub use backend::{default_backends, scheme_supported, MediaReader, StreamProperties, TransportBackend};
pub use backoff::BackoffPolicy;

use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, StreamSettings};
use crate::frame::Frame;

/// URL schemes accepted by `validate_source_url`.
pub const ALLOWED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file", "stub"];

/// Granularity of interruptible sleeps and watchdog waits.
const SLICE: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// Connection state
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of ingestor output. Called from the capture thread.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame);

    fn on_error(&self, message: &str);

    fn on_state(&self, _state: ConnectionState) {}
}

/// Reject URLs whose scheme is not on the allow-list. Performs no I/O.
pub fn validate_source_url(url: &str) -> std::result::Result<String, ConfigError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| ConfigError::new("stream.url", format!("invalid url '{}': {}", url, e)))?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(ConfigError::new(
            "stream.url",
            format!(
                "unsupported scheme '{}'; expected one of {}",
                scheme,
                ALLOWED_SCHEMES.join(", ")
            ),
        ));
    }
    Ok(scheme)
}

// ----------------------------------------------------------------------------
// Ingestor
// ----------------------------------------------------------------------------

/// State shared between the ingestor handle and its capture thread.
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    state: AtomicU8,
    fps_bits: AtomicU64,
    frames_captured: AtomicU64,
    reconnect_attempts: AtomicU32,
    fatal: AtomicBool,
    properties: Mutex<Option<StreamProperties>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            fps_bits: AtomicU64::new(0f64.to_bits()),
            frames_captured: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            fatal: AtomicBool::new(false),
            properties: Mutex::new(None),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Release);
    }

    fn set_properties(&self, properties: Option<StreamProperties>) {
        let mut guard = self
            .properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = properties;
    }
}

pub struct StreamIngestor {
    settings: StreamSettings,
    backends: Vec<Arc<dyn TransportBackend>>,
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl StreamIngestor {
    /// Ingestor over the backends compiled into this build.
    pub fn new(settings: StreamSettings) -> Self {
        Self::with_backends(settings, default_backends())
    }

    /// Ingestor over an explicit, ordered backend list.
    pub fn with_backends(
        settings: StreamSettings,
        backends: Vec<Arc<dyn TransportBackend>>,
    ) -> Self {
        Self {
            settings,
            backends,
            shared: Arc::new(Shared::new()),
            join: None,
        }
    }

    /// Validate the URL and start the capture thread.
    pub fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.join.is_some() {
            bail!("stream ingestor already started");
        }
        let scheme = validate_source_url(&self.settings.url)?;
        if !self.backends.iter().any(|b| b.supports(&scheme)) {
            bail!("no transport backend in this build supports '{}'", scheme);
        }

        self.shared.fatal.store(false, Ordering::Release);
        self.shared.reconnect_attempts.store(0, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let mut worker = CaptureWorker {
            settings: self.settings.clone(),
            policy: BackoffPolicy::from_settings(&self.settings),
            scheme,
            backends: self.backends.clone(),
            shared: Arc::clone(&self.shared),
            sink,
            reader: None,
            sequence: 0,
        };
        let spawned = std::thread::Builder::new()
            .name("ingest".into())
            .spawn(move || worker.run());
        match spawned {
            Ok(join) => {
                self.join = Some(join);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(anyhow!("spawn ingest thread: {}", err))
            }
        }
    }

    /// Stop capture and join the thread.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("ingest thread panicked");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared
            .state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Delivered frames per second, measured over roughly one-second windows.
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.shared.fps_bits.load(Ordering::Acquire))
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.frames_captured.load(Ordering::Acquire)
    }

    /// Reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Acquire)
    }

    /// True once the ingestor gave up after exceeding the reconnect cap.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Acquire)
    }

    /// Properties negotiated by the current connection, if any.
    pub fn properties(&self) -> Option<StreamProperties> {
        *self
            .shared
            .properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Cloneable read-only view for other threads.
    pub fn status(&self) -> IngestStatus {
        IngestStatus {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only view of a running ingestor, shareable across threads.
#[derive(Clone)]
pub struct IngestStatus {
    shared: Arc<Shared>,
}

impl IngestStatus {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.frames_captured.load(Ordering::Acquire)
    }
}

impl Drop for StreamIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

struct CaptureWorker {
    settings: StreamSettings,
    policy: BackoffPolicy,
    scheme: String,
    backends: Vec<Arc<dyn TransportBackend>>,
    shared: Arc<Shared>,
    sink: Arc<dyn FrameSink>,
    reader: Option<Box<dyn MediaReader>>,
    sequence: u64,
}

impl CaptureWorker {
    fn run(&mut self) {
        while self.shared.running() {
            match self.connect() {
                Ok(()) => self.capture_loop(),
                Err(err) => {
                    let message = format!("connect {} failed: {:#}", self.settings.url, err);
                    log::warn!("{}", message);
                    self.sink.on_error(&message);
                    self.set_state(ConnectionState::Error);
                }
            }
            if !self.shared.running() {
                break;
            }
            if !self.reconnect_with_backoff() {
                break;
            }
        }
        self.reader = None;
        self.shared.connected.store(false, Ordering::Release);
        if !self.shared.fatal.load(Ordering::Acquire) {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Try each backend that handles the scheme, each bounded by the connect timeout.
    fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let mut failures = Vec::new();

        for backend in self.backends.iter().filter(|b| b.supports(&self.scheme)) {
            if !self.shared.running() {
                bail!("stopped while connecting");
            }
            match self.open_with_watchdog(backend) {
                Ok(reader) => {
                    let properties = reader.properties();
                    log::info!(
                        "stream {} connected via {} ({}x{})",
                        self.settings.url,
                        backend.name(),
                        properties.width,
                        properties.height
                    );
                    self.shared.set_properties(Some(properties));
                    self.reader = Some(reader);
                    self.shared.reconnect_attempts.store(0, Ordering::Release);
                    self.shared.connected.store(true, Ordering::Release);
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("backend {} failed: {:#}", backend.name(), err);
                    failures.push(format!("{}: {:#}", backend.name(), err));
                }
            }
        }

        if failures.is_empty() {
            bail!("no transport backend supports '{}'", self.scheme);
        }
        bail!("all transport backends failed ({})", failures.join("; "))
    }

    /// Run `open` on a helper thread; give up after the connect timeout.
    /// An abandoned open finishes in the background and its reader is dropped.
    fn open_with_watchdog(
        &self,
        backend: &Arc<dyn TransportBackend>,
    ) -> Result<Box<dyn MediaReader>> {
        let (tx, rx) = mpsc::channel();
        let opener = Arc::clone(backend);
        let url = self.settings.url.clone();
        let io_timeout = self.settings.connect_timeout;
        std::thread::Builder::new()
            .name(format!("open-{}", backend.name()))
            .spawn(move || {
                let _ = tx.send(opener.open(&url, io_timeout));
            })
            .map_err(|e| anyhow!("spawn open thread: {}", e))?;

        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out after {:?}", self.settings.connect_timeout);
            }
            match rx.recv_timeout(remaining.min(SLICE)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.running() {
                        bail!("stopped while connecting");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => bail!("open thread exited"),
            }
        }
    }

    /// Read, pace and emit frames until a read fails or the ingestor stops.
    fn capture_loop(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.settings.target_fps.max(1)));
        let mut window_start = Instant::now();
        let mut window_frames = 0u32;

        while self.shared.running() {
            let started = Instant::now();
            let image = match reader.read_frame() {
                Ok(image) if image.width() > 0 && image.height() > 0 => image,
                Ok(_) => {
                    self.on_read_failure("transport returned an empty frame");
                    return;
                }
                Err(err) => {
                    self.on_read_failure(&format!("{:#}", err));
                    return;
                }
            };

            self.sequence += 1;
            let frame = Frame::new(image, self.settings.camera_id.clone(), self.sequence);
            self.shared.frames_captured.fetch_add(1, Ordering::AcqRel);
            self.sink.on_frame(frame);

            window_frames += 1;
            let window = window_start.elapsed();
            if window >= Duration::from_secs(1) {
                self.shared
                    .set_fps(f64::from(window_frames) / window.as_secs_f64());
                window_start = Instant::now();
                window_frames = 0;
            }

            let spent = started.elapsed();
            if spent < interval {
                sleep_while_running(&self.shared, interval - spent);
            }
        }
    }

    /// Sleep for the next backoff delay. Returns false when the ingestor must
    /// stop, either because it was asked to or because the cap was exceeded.
    fn reconnect_with_backoff(&mut self) -> bool {
        let attempt = self.shared.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if self.policy.exhausted(attempt) {
            let message = format!(
                "giving up on {} after {} reconnect attempts",
                self.settings.url,
                attempt - 1
            );
            log::error!("{}", message);
            self.shared.fatal.store(true, Ordering::Release);
            self.shared.running.store(false, Ordering::Release);
            self.set_state(ConnectionState::Error);
            self.sink.on_error(&message);
            return false;
        }
        let delay = self.policy.delay_for(attempt);
        log::info!(
            "reconnecting to {} in {:?} (attempt {})",
            self.settings.url,
            delay,
            attempt
        );
        sleep_while_running(&self.shared, delay);
        self.shared.running()
    }

    fn on_read_failure(&mut self, reason: &str) {
        let message = format!("stream {} read failed: {}", self.settings.url, reason);
        log::warn!("{}", message);
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_fps(0.0);
        self.shared.set_properties(None);
        self.set_state(ConnectionState::Disconnected);
        self.sink.on_error(&message);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            self.sink.on_state(state);
        }
    }
}

fn sleep_while_running(shared: &Shared, total: Duration) {
    let deadline = Instant::now() + total;
    while shared.running() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(SLICE));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
