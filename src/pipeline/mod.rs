//! Pipeline orchestrator.
//!
//! Thread layout:
//! - ingest:    `StreamIngestor` capture thread -> frame queue (backpressure policy)
//! - condition: frame queue -> `FrameConditioner` -> inference queue
//! - infer:     inference queue -> `InferenceGateway` -> `PipelineEvents`
//! - metrics:   stats, telemetry gauges, shutdown and fatal-stop detection
//!
//! Accounting: every frame that reaches the pipeline is counted exactly once,
//! as processed (handed to the inference queue) or dropped. Quality rejections
//! are also counted as rejected.
//!
//! Shutdown order: ingestor, then both worker loops drain their queues, then
//! metrics, then telemetry.

pub mod events;

pub use events::{DropReason, LogEvents, PipelineEvents};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::condition::FrameConditioner;
use crate::config::{AppConfig, ConfigError};
use crate::discovery;
use crate::frame::Frame;
use crate::gateway::{GatewayCallbacks, InferenceGateway};
use crate::ingest::{
    default_backends, ConnectionState, FrameSink, IngestStatus, StreamIngestor, TransportBackend,
};
use crate::queue::BoundedQueue;
use crate::telemetry::{TelemetryHandle, TelemetryServer, TelemetryState};

/// Worker wait on an empty queue before re-checking the running flag.
const POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Granularity of the metrics loop sleep.
const METRICS_SLICE: Duration = Duration::from_millis(50);
/// EMA smoothing factor for end-to-end inference latency.
const LATENCY_ALPHA: f64 = 0.1;

// ----------------------------------------------------------------------------
// Drop policy
// ----------------------------------------------------------------------------

/// What to do when a frame arrives and the frame queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame, then enqueue the new one.
    #[default]
    DropOldest,
    /// Discard the arriving frame.
    DropNewest,
    /// Never blocks the producer: the arriving frame is discarded.
    Block,
}

impl DropPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DropPolicy::DropOldest => "drop_oldest",
            DropPolicy::DropNewest => "drop_newest",
            DropPolicy::Block => "block",
        }
    }
}

impl std::fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DropPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" => Ok(DropPolicy::DropOldest),
            "drop_newest" => Ok(DropPolicy::DropNewest),
            "block" => Ok(DropPolicy::Block),
            other => Err(ConfigError::new(
                "pipeline.drop_policy",
                format!(
                    "unknown policy '{}'; expected drop_oldest, drop_newest or block",
                    other
                ),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Stats {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    /// Subset of `frames_dropped` rejected on quality.
    pub frames_rejected: u64,
    pub inferences_succeeded: u64,
    pub inferences_failed: u64,
    /// Frame arrival rate over the last metrics interval.
    pub current_fps: f64,
    /// Exponential moving average of successful `infer` calls, retries included.
    pub avg_latency_ms: f64,
    pub started_at: SystemTime,
}

impl Stats {
    fn new() -> Self {
        Self {
            frames_received: 0,
            frames_processed: 0,
            frames_dropped: 0,
            frames_rejected: 0,
            inferences_succeeded: 0,
            inferences_failed: 0,
            current_fps: 0.0,
            avg_latency_ms: 0.0,
            started_at: SystemTime::now(),
        }
    }

    /// Frames counted as neither processed nor dropped yet.
    pub fn in_flight(&self) -> u64 {
        self.frames_received
            .saturating_sub(self.frames_processed + self.frames_dropped)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Shared core
// ----------------------------------------------------------------------------

/// State shared by the arrival path and the worker threads.
struct Core {
    running: AtomicBool,
    conditioning_done: AtomicBool,
    stop_requested: AtomicBool,
    external_source: bool,
    frame_queue: BoundedQueue<Frame>,
    inference_queue: BoundedQueue<Frame>,
    drop_policy: DropPolicy,
    conditioner: FrameConditioner,
    gateway: InferenceGateway,
    stats: Mutex<Stats>,
    events: Arc<dyn PipelineEvents>,
    telemetry: Arc<TelemetryState>,
    ingest_status: Mutex<Option<IngestStatus>>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Core {
    fn lock_stats(&self) -> MutexGuard<'_, Stats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn record_drop(&self, source_id: &str, sequence: u64, reason: DropReason) {
        {
            let mut stats = self.lock_stats();
            stats.frames_dropped += 1;
            if reason == DropReason::QualityRejected {
                stats.frames_rejected += 1;
            }
        }
        self.events.frame_dropped(source_id, sequence, reason);
    }

    /// Arrival path: count the frame and apply the backpressure policy.
    fn accept(&self, frame: Frame) -> bool {
        self.lock_stats().frames_received += 1;
        self.events.frame_received(&frame);

        if !self.running() {
            self.record_drop(&frame.source_id, frame.sequence, DropReason::NotRunning);
            return false;
        }

        let frame = match self.frame_queue.try_push(frame) {
            Ok(()) => return true,
            Err(frame) => frame,
        };

        match self.drop_policy {
            DropPolicy::DropOldest => {
                if let Some(evicted) = self.frame_queue.try_pop() {
                    self.record_drop(&evicted.source_id, evicted.sequence, DropReason::Evicted);
                }
                match self.frame_queue.try_push(frame) {
                    Ok(()) => true,
                    Err(frame) => {
                        self.record_drop(&frame.source_id, frame.sequence, DropReason::QueueFull);
                        false
                    }
                }
            }
            DropPolicy::DropNewest | DropPolicy::Block => {
                self.record_drop(&frame.source_id, frame.sequence, DropReason::QueueFull);
                false
            }
        }
    }

    fn condition_loop(&self) {
        log::info!("condition loop started");
        while self.running() || !self.frame_queue.is_empty() {
            let Some(frame) = self.frame_queue.pop_wait(POP_TIMEOUT) else {
                continue;
            };
            let frame = self.conditioner.process(frame);
            if FrameConditioner::is_rejected(&frame) {
                self.record_drop(&frame.source_id, frame.sequence, DropReason::QualityRejected);
                continue;
            }
            self.events.frame_preprocessed(&frame);
            let (source_id, sequence) = (frame.source_id.clone(), frame.sequence);
            match self.inference_queue.try_push(frame) {
                Ok(()) => self.lock_stats().frames_processed += 1,
                Err(_) => self.record_drop(&source_id, sequence, DropReason::InferenceCongested),
            }
        }
        self.conditioning_done.store(true, Ordering::Release);
        log::info!("condition loop stopped");
    }

    fn infer_loop(&self) {
        log::info!("inference loop started");
        loop {
            let draining = !self.running() && self.conditioning_done.load(Ordering::Acquire);
            if draining && self.inference_queue.is_empty() {
                break;
            }
            let Some(frame) = self.inference_queue.pop_wait(POP_TIMEOUT) else {
                continue;
            };
            let started = Instant::now();
            match self.gateway.infer(&frame) {
                Ok(result) => {
                    let latency = started.elapsed();
                    {
                        let mut stats = self.lock_stats();
                        stats.inferences_succeeded += 1;
                        let sample = latency.as_secs_f64() * 1000.0;
                        stats.avg_latency_ms = if stats.inferences_succeeded == 1 {
                            sample
                        } else {
                            (1.0 - LATENCY_ALPHA) * stats.avg_latency_ms + LATENCY_ALPHA * sample
                        };
                    }
                    self.events.inference_succeeded(&result, latency);
                }
                Err(err) => {
                    self.lock_stats().inferences_failed += 1;
                    self.events
                        .inference_failed(&frame.source_id, frame.sequence, &err);
                }
            }
        }
        log::info!("inference loop stopped");
    }

    fn metrics_loop(&self, interval: Duration) {
        log::info!("metrics loop started");
        let mut last_tick = Instant::now();
        let mut last_received = 0u64;
        let mut fatal_reported = false;

        while self.running() {
            let deadline = last_tick + interval;
            while self.running() && Instant::now() < deadline {
                std::thread::sleep(METRICS_SLICE.min(deadline.saturating_duration_since(Instant::now())));
            }
            if !self.running() {
                break;
            }

            let elapsed = last_tick.elapsed().as_secs_f64();
            last_tick = Instant::now();
            let snapshot = {
                let mut stats = self.lock_stats();
                if elapsed > 0.0 {
                    stats.current_fps =
                        stats.frames_received.saturating_sub(last_received) as f64 / elapsed;
                }
                last_received = stats.frames_received;
                *stats
            };

            let status = self.ingest_status();
            if let Some(status) = &status {
                if status.is_fatal() && !fatal_reported {
                    fatal_reported = true;
                    log::error!(
                        "stream ingestor stopped permanently after {} reconnect attempts",
                        status.reconnect_attempts()
                    );
                }
            }
            self.publish(&snapshot, status.as_ref());
            log_stats(&snapshot, self.frame_queue.len(), self.inference_queue.len());

            if let Some(flag) = &self.shutdown {
                if flag.load(Ordering::Acquire) && !self.stop_requested.swap(true, Ordering::AcqRel) {
                    log::info!("shutdown requested");
                }
            }
        }
        log::info!("metrics loop stopped");
    }

    fn ingest_status(&self) -> Option<IngestStatus> {
        self.ingest_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, stats: &Stats, status: Option<&IngestStatus>) {
        let telemetry = &self.telemetry;
        telemetry.set_fps(stats.current_fps);
        telemetry.set_queue_size(self.frame_queue.len() + self.inference_queue.len());
        telemetry.set_ai_healthy(self.gateway.is_healthy());
        if let Some(status) = status {
            telemetry.set_stream_connected(status.is_connected() && !status.is_fatal());
            telemetry.set_gauge("reconnect_attempts", f64::from(status.reconnect_attempts()));
        } else if !self.external_source {
            telemetry.set_stream_connected(false);
        }
        telemetry.set_gauge("frames_received", stats.frames_received as f64);
        telemetry.set_gauge("frames_processed", stats.frames_processed as f64);
        telemetry.set_gauge("frames_dropped", stats.frames_dropped as f64);
        telemetry.set_gauge("frames_rejected", stats.frames_rejected as f64);
        telemetry.set_gauge("inferences_succeeded", stats.inferences_succeeded as f64);
        telemetry.set_gauge("inferences_failed", stats.inferences_failed as f64);
        telemetry.set_gauge("avg_latency_ms", stats.avg_latency_ms);
        telemetry.set_gauge("inference_queue_size", self.inference_queue.len() as f64);
    }
}

fn log_stats(stats: &Stats, frame_queue: usize, inference_queue: usize) {
    log::info!(
        "stats fps={:.1} received={} processed={} dropped={} rejected={} \
         inferred_ok={} inferred_failed={} avg_latency_ms={:.1} frame_queue={} inference_queue={}",
        stats.current_fps,
        stats.frames_received,
        stats.frames_processed,
        stats.frames_dropped,
        stats.frames_rejected,
        stats.inferences_succeeded,
        stats.inferences_failed,
        stats.avg_latency_ms,
        frame_queue,
        inference_queue
    );
}

/// Adapter from ingestor callbacks to the shared core.
struct CoreSink(Arc<Core>);

impl FrameSink for CoreSink {
    fn on_frame(&self, frame: Frame) {
        self.0.accept(frame);
    }

    fn on_error(&self, message: &str) {
        self.0.events.stream_error(message);
    }

    fn on_state(&self, state: ConnectionState) {
        self.0
            .telemetry
            .set_stream_connected(state == ConnectionState::Connected);
        self.0.events.connection_changed(state);
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    config: Arc<AppConfig>,
    events: Arc<dyn PipelineEvents>,
    backends: Vec<Arc<dyn TransportBackend>>,
    shutdown: Option<Arc<AtomicBool>>,
    telemetry: Arc<TelemetryState>,
    core: Option<Arc<Core>>,
    ingestor: Option<StreamIngestor>,
    workers: Vec<JoinHandle<()>>,
    telemetry_handle: Option<TelemetryHandle>,
}

impl Pipeline {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            events: Arc::new(LogEvents),
            backends: default_backends(),
            shutdown: None,
            telemetry: Arc::new(TelemetryState::new()),
            core: None,
            ingestor: None,
            workers: Vec::new(),
            telemetry_handle: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn PipelineEvents>) -> Self {
        self.events = events;
        self
    }

    /// Replace the transport backends handed to the ingestor.
    pub fn with_backends(mut self, backends: Vec<Arc<dyn TransportBackend>>) -> Self {
        self.backends = backends;
        self
    }

    /// Flag the metrics loop watches; once set, `stop_requested()` turns true.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Start every stage, including the stream ingestor.
    pub fn start(&mut self) -> Result<()> {
        self.launch(false)
    }

    /// Start every stage except the ingestor; frames arrive through `ingest`.
    pub fn start_with_external_source(&mut self) -> Result<()> {
        self.launch(true)
    }

    fn launch(&mut self, external_source: bool) -> Result<()> {
        if self.core.is_some() {
            bail!("pipeline already started");
        }
        self.config.validate_with_backends(&self.backends)?;
        let cfg = Arc::clone(&self.config);

        let telemetry = Arc::clone(&self.telemetry);
        let health_events = Arc::clone(&self.events);
        let callbacks = GatewayCallbacks {
            on_health_change: Some(Box::new(move |healthy| {
                telemetry.set_ai_healthy(healthy);
                health_events.ai_health_changed(healthy);
            })),
            on_error: None,
        };
        let gateway = InferenceGateway::with_callbacks(cfg.ai_service.clone(), callbacks);
        self.telemetry.set_ai_healthy(gateway.is_healthy());

        let core = Arc::new(Core {
            running: AtomicBool::new(true),
            conditioning_done: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            external_source,
            frame_queue: BoundedQueue::new(cfg.pipeline.frame_queue_capacity),
            inference_queue: BoundedQueue::new(cfg.pipeline.inference_queue_capacity),
            drop_policy: cfg.pipeline.drop_policy,
            conditioner: FrameConditioner::new(cfg.preprocessing.clone()),
            gateway,
            stats: Mutex::new(Stats::new()),
            events: Arc::clone(&self.events),
            telemetry: Arc::clone(&self.telemetry),
            ingest_status: Mutex::new(None),
            shutdown: self.shutdown.clone(),
        });
        self.core = Some(Arc::clone(&core));

        if cfg.telemetry.enabled {
            let server = TelemetryServer::new(cfg.telemetry.clone(), Arc::clone(&self.telemetry))
                .with_discover_handler(Arc::new(discovery::discover_from_query));
            match server.spawn() {
                Ok(handle) => self.telemetry_handle = Some(handle),
                Err(err) => {
                    self.abort_launch();
                    return Err(err);
                }
            }
        }

        let interval = cfg.telemetry.metrics_interval;
        let spawned = spawn_worker("condition", &core, |core| core.condition_loop())
            .and_then(|condition| {
                let infer = spawn_worker("infer", &core, |core| core.infer_loop())?;
                Ok(vec![condition, infer])
            })
            .and_then(|mut workers| {
                workers.push(spawn_worker("metrics", &core, move |core| {
                    core.metrics_loop(interval)
                })?);
                Ok(workers)
            });
        match spawned {
            Ok(workers) => self.workers = workers,
            Err(err) => {
                self.abort_launch();
                return Err(err);
            }
        }

        if external_source {
            self.telemetry.set_stream_connected(true);
        } else {
            let mut ingestor =
                StreamIngestor::with_backends(cfg.stream.clone(), self.backends.clone());
            if let Err(err) = ingestor.start(Arc::new(CoreSink(Arc::clone(&core)))) {
                self.abort_launch();
                return Err(err.context("start stream ingestor"));
            }
            *core
                .ingest_status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ingestor.status());
            self.ingestor = Some(ingestor);
        }

        log::info!(
            "pipeline started: source={} camera={} fps={} policy={} queues={}/{}",
            if external_source { "external" } else { cfg.stream.url.as_str() },
            cfg.stream.camera_id,
            cfg.stream.target_fps,
            cfg.pipeline.drop_policy,
            cfg.pipeline.frame_queue_capacity,
            cfg.pipeline.inference_queue_capacity
        );
        Ok(())
    }

    fn abort_launch(&mut self) {
        self.stop();
        self.core = None;
    }

    /// Offer a frame from an external capture source.
    /// Returns true when the frame was queued.
    pub fn ingest(&self, frame: Frame) -> bool {
        match &self.core {
            Some(core) => core.accept(frame),
            None => {
                log::warn!(
                    "pipeline not started; discarding frame {}#{}",
                    frame.source_id,
                    frame.sequence
                );
                false
            }
        }
    }

    /// Report connectivity for an external source.
    pub fn set_stream_connected(&self, connected: bool) {
        self.telemetry.set_stream_connected(connected);
    }

    pub fn is_running(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.running())
    }

    /// True once the shutdown flag was observed by the metrics loop.
    pub fn stop_requested(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.stop_requested.load(Ordering::Acquire))
    }

    /// True when the ingestor gave up after its reconnect cap.
    pub fn is_fatal(&self) -> bool {
        self.ingestor.as_ref().is_some_and(|ingestor| ingestor.is_fatal())
    }

    pub fn stats(&self) -> Stats {
        self.core
            .as_ref()
            .map(|core| *core.lock_stats())
            .unwrap_or_default()
    }

    pub fn telemetry(&self) -> Arc<TelemetryState> {
        Arc::clone(&self.telemetry)
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.telemetry_handle.as_ref().map(|handle| handle.addr)
    }

    pub fn queue_depths(&self) -> (usize, usize) {
        self.core
            .as_ref()
            .map(|core| (core.frame_queue.len(), core.inference_queue.len()))
            .unwrap_or((0, 0))
    }

    /// Stop in order and return the final stats. Safe to call more than once.
    pub fn stop(&mut self) -> Stats {
        if let Some(mut ingestor) = self.ingestor.take() {
            ingestor.stop();
        }

        if let Some(core) = &self.core {
            core.running.store(false, Ordering::Release);
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                log::error!("pipeline {} thread panicked", name);
            }
        }

        let stats = match &self.core {
            Some(core) => {
                // Workers drain before exiting; leftovers only remain after a panic.
                while let Some(frame) = core.frame_queue.try_pop() {
                    core.record_drop(&frame.source_id, frame.sequence, DropReason::NotRunning);
                }
                let abandoned = core.inference_queue.clear();
                if abandoned > 0 {
                    log::warn!("{} conditioned frames were never inferred", abandoned);
                }
                let stats = *core.lock_stats();
                core.publish(&stats, None);
                stats
            }
            None => Stats::new(),
        };
        self.telemetry.set_stream_connected(false);

        if let Some(handle) = self.telemetry_handle.take() {
            if let Err(err) = handle.stop() {
                log::error!("{}", err);
            }
        }
        stats
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Stop `pipeline`, log the final stats and return them.
pub fn shutdown(pipeline: &mut Pipeline) -> Stats {
    let stats = pipeline.stop();
    log_stats(&stats, 0, 0);
    stats
}

/// Start a pipeline built from `next`. When it fails to start, log why and
/// start one from `previous` instead. Returns the running pipeline together
/// with the config it runs on.
pub fn restart_with<F>(
    next: Arc<AppConfig>,
    previous: Arc<AppConfig>,
    build: F,
) -> Result<(Pipeline, Arc<AppConfig>)>
where
    F: Fn(Arc<AppConfig>) -> Pipeline,
{
    let mut pipeline = build(Arc::clone(&next));
    match pipeline.start() {
        Ok(()) => Ok((pipeline, next)),
        Err(err) => {
            log::error!(
                "reloaded config failed to start, keeping the previous one: {:#}",
                err
            );
            drop(pipeline);
            let mut pipeline = build(Arc::clone(&previous));
            pipeline
                .start()
                .context("restart pipeline with previous config")?;
            Ok((pipeline, previous))
        }
    }
}

fn spawn_worker<F>(name: &str, core: &Arc<Core>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(&Core) + Send + 'static,
{
    let core = Arc::clone(core);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&core))
        .with_context(|| format!("spawn {} thread", name))
}
