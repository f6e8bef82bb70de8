//! lpr-edge: edge licence-plate recognition pipeline.
//!
//! Frames are pulled from a camera stream, scored and normalized, then sent
//! to a remote plate reader. Every stage runs on its own thread and stages
//! are joined by bounded queues, so a slow reader sheds frames instead of
//! growing memory.
//!
//! # Module Structure
//!
//! - `queue`: bounded, thread-safe FIFO shared between stages
//! - `frame`: frame payload, geometry back to source coordinates, results
//! - `ingest`: stream ingestor, transport backends, reconnect backoff
//! - `condition`: quality scoring and image normalization
//! - `gateway`: HTTP client for the inference service
//! - `pipeline`: orchestrator, backpressure policies, stats, events
//! - `telemetry`: `/healthz`, `/status`, `/metrics`, `/discover`
//! - `discovery`: candidate RTSP URLs per camera vendor
//! - `config`: layered configuration and hot-reload watcher

pub mod condition;
pub mod config;
pub mod discovery;
pub mod frame;
pub mod gateway;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod telemetry;

pub use condition::{FrameConditioner, QualityReport, QualityWeights};
pub use config::{AppConfig, ConfigError, ConfigWatcher};
pub use discovery::{discover, DiscoveryError, DiscoveryRequest};
pub use frame::{BoundingBox, Frame, FrameGeometry, InferenceResult};
pub use gateway::{GatewayCallbacks, GatewayStats, InferenceGateway};
pub use ingest::{ConnectionState, FrameSink, StreamIngestor};
pub use pipeline::{DropPolicy, Pipeline, PipelineEvents, Stats};
pub use queue::BoundedQueue;
pub use telemetry::{TelemetryServer, TelemetryState};
