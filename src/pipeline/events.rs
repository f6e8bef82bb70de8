//! Pipeline event sink.
//!
//! Worker threads report what happens to each frame through `PipelineEvents`.
//! Every method has an empty default so embedders implement only what they
//! need. `LogEvents` renders events as `key=value` log lines.

use std::time::Duration;

use crate::frame::{Frame, InferenceResult};
use crate::ingest::ConnectionState;

/// Why a frame left the pipeline without reaching the inference queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted from a full frame queue to make room for a newer frame.
    Evicted,
    /// Discarded on arrival because the frame queue was full.
    QueueFull,
    /// Scored below the quality threshold.
    QualityRejected,
    /// Conditioned, but the inference queue was full.
    InferenceCongested,
    /// Arrived while the pipeline was not running.
    NotRunning,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Evicted => "evicted",
            DropReason::QueueFull => "queue_full",
            DropReason::QualityRejected => "quality_rejected",
            DropReason::InferenceCongested => "inference_congested",
            DropReason::NotRunning => "not_running",
        }
    }
}

pub trait PipelineEvents: Send + Sync {
    fn frame_received(&self, _frame: &Frame) {}

    fn frame_preprocessed(&self, _frame: &Frame) {}

    fn frame_dropped(&self, _source_id: &str, _sequence: u64, _reason: DropReason) {}

    fn inference_succeeded(&self, _result: &InferenceResult, _latency: Duration) {}

    fn inference_failed(&self, _source_id: &str, _sequence: u64, _error: &anyhow::Error) {}

    fn connection_changed(&self, _state: ConnectionState) {}

    /// The inference service health flag flipped.
    fn ai_health_changed(&self, _healthy: bool) {}

    fn stream_error(&self, _message: &str) {}
}

/// Default sink: one `key=value` line per event through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEvents;

impl PipelineEvents for LogEvents {
    fn frame_received(&self, frame: &Frame) {
        log::trace!(
            "event=frame_received source={} seq={} width={} height={}",
            frame.source_id,
            frame.sequence,
            frame.width(),
            frame.height()
        );
    }

    fn frame_preprocessed(&self, frame: &Frame) {
        log::debug!(
            "event=frame_preprocessed source={} seq={} quality={:.3}",
            frame.source_id,
            frame.sequence,
            frame.quality.unwrap_or_default()
        );
    }

    fn frame_dropped(&self, source_id: &str, sequence: u64, reason: DropReason) {
        log::debug!(
            "event=frame_dropped source={} seq={} reason={}",
            source_id,
            sequence,
            reason.as_str()
        );
    }

    fn inference_succeeded(&self, result: &InferenceResult, latency: Duration) {
        log::info!(
            "event=inference source={} seq={} plate={:?} confidence={:.3} bbox={},{},{},{} latency_ms={:.1}",
            result.source_id,
            result.sequence,
            result.plate_text,
            result.confidence,
            result.bbox.x,
            result.bbox.y,
            result.bbox.width,
            result.bbox.height,
            latency.as_secs_f64() * 1000.0
        );
    }

    fn inference_failed(&self, source_id: &str, sequence: u64, error: &anyhow::Error) {
        log::error!(
            "event=inference_failed source={} seq={} error={:#}",
            source_id,
            sequence,
            error
        );
    }

    fn connection_changed(&self, state: ConnectionState) {
        log::info!("event=connection state={}", state);
    }

    fn ai_health_changed(&self, healthy: bool) {
        if healthy {
            log::info!("event=ai_health healthy=true");
        } else {
            log::warn!("event=ai_health healthy=false");
        }
    }

    fn stream_error(&self, message: &str) {
        log::warn!("event=stream_error message={:?}", message);
    }
}
