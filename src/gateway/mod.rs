//! Inference gateway: frame -> remote plate reader -> `InferenceResult`.
//!
//! Each `infer` call makes up to `retry_count + 1` attempts separated by a
//! fixed delay. Every attempt is counted in `GatewayStats`. The health flag
//! follows the outcome of the last completed call and is reported to the
//! health callback only when it changes.

pub mod wire;

use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use crate::config::AiServiceSettings;
use crate::frame::{Frame, InferenceResult};

/// EMA smoothing factor for request latency.
const LATENCY_ALPHA: f64 = 0.1;
/// Upper bound on an inference response body.
const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

pub type HealthCallback = Box<dyn Fn(bool) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Optional observers wired in at construction.
#[derive(Default)]
pub struct GatewayCallbacks {
    /// Called with the new value whenever the health flag flips.
    pub on_health_change: Option<HealthCallback>,
    /// Called with a description of every failed attempt.
    pub on_error: Option<ErrorCallback>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average over successful attempts.
    pub avg_latency_ms: f64,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
}

pub struct InferenceGateway {
    settings: AiServiceSettings,
    agent: ureq::Agent,
    infer_url: String,
    health_url: String,
    healthy: AtomicBool,
    stats: Mutex<GatewayStats>,
    callbacks: GatewayCallbacks,
}

impl InferenceGateway {
    pub fn new(settings: AiServiceSettings) -> Self {
        Self::with_callbacks(settings, GatewayCallbacks::default())
    }

    /// Build the gateway and run one health probe.
    pub fn with_callbacks(settings: AiServiceSettings, callbacks: GatewayCallbacks) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        let host = settings.host.trim_end_matches('/');
        let gateway = Self {
            infer_url: format!("{}/infer", host),
            health_url: format!("{}/healthz", host),
            settings,
            agent,
            healthy: AtomicBool::new(false),
            stats: Mutex::new(GatewayStats::default()),
            callbacks,
        };
        gateway.check_health();
        gateway
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GatewayStats {
        *self.lock_stats()
    }

    /// `GET {host}/healthz`; healthy iff the call returns 2xx.
    pub fn check_health(&self) -> bool {
        let healthy = match self.agent.get(&self.health_url).call() {
            Ok(_) => true,
            Err(err) => {
                log::debug!("inference health probe failed: {}", err);
                false
            }
        };
        self.set_health(healthy);
        healthy
    }

    /// Run inference on one frame with bounded retries.
    pub fn infer(&self, frame: &Frame) -> Result<InferenceResult> {
        if frame.is_empty() {
            bail!(
                "refusing to send empty frame {}#{}",
                frame.source_id,
                frame.sequence
            );
        }
        let jpeg = wire::encode_jpeg(frame.image(), self.settings.jpeg_quality)?;

        let attempts = self.settings.retry_count.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.attempt(&jpeg, frame) {
                Ok(result) => {
                    self.record(true, started.elapsed().as_secs_f64() * 1000.0);
                    self.set_health(true);
                    return Ok(result);
                }
                Err(err) => {
                    self.record(false, 0.0);
                    let message = format!(
                        "inference attempt {}/{} for {}#{} failed: {:#}",
                        attempt, attempts, frame.source_id, frame.sequence, err
                    );
                    log::warn!("{}", message);
                    if let Some(on_error) = &self.callbacks.on_error {
                        on_error(&message);
                    }
                    last_error = Some(err);
                }
            }
            if attempt < attempts && !self.settings.retry_delay.is_zero() {
                std::thread::sleep(self.settings.retry_delay);
            }
        }

        self.set_health(false);
        Err(last_error
            .unwrap_or_else(|| anyhow!("no inference attempt made"))
            .context(format!("inference failed after {} attempts", attempts)))
    }

    fn attempt(&self, jpeg: &[u8], frame: &Frame) -> Result<InferenceResult> {
        let body = wire::multipart_body(jpeg, &frame.source_id);
        let response = match self
            .agent
            .post(&self.infer_url)
            .set("Content-Type", &body.content_type)
            .send_bytes(&body.bytes)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => bail!("inference service returned HTTP {}", code),
            Err(err) => return Err(anyhow!("inference request failed: {}", err)),
        };

        let mut text = String::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_string(&mut text)
            .context("read inference response")?;

        let parsed = wire::parse_response(&text)?;
        let bbox = match parsed.bbox {
            Some(wire_box) => {
                let (x, y, w, h) = wire_box.to_rect();
                frame.geometry.to_source(x, y, w, h)
            }
            None => Default::default(),
        };

        Ok(InferenceResult {
            plate_text: parsed.plate_text,
            confidence: parsed.confidence,
            bbox,
            vehicle_color: parsed.vehicle_color,
            vehicle_type: parsed.vehicle_type,
            captured_at: frame.captured_at,
            source_id: frame.source_id.clone(),
            sequence: frame.sequence,
        })
    }

    fn record(&self, success: bool, latency_ms: f64) {
        let mut stats = self.lock_stats();
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
            stats.last_success = Some(SystemTime::now());
            stats.avg_latency_ms = if stats.successful_requests == 1 {
                latency_ms
            } else {
                (1.0 - LATENCY_ALPHA) * stats.avg_latency_ms + LATENCY_ALPHA * latency_ms
            };
        } else {
            stats.failed_requests += 1;
            stats.last_failure = Some(SystemTime::now());
        }
    }

    fn set_health(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        if previous == healthy {
            return;
        }
        log::info!(
            "inference service is now {}",
            if healthy { "healthy" } else { "unhealthy" }
        );
        if let Some(on_change) = &self.callbacks.on_health_change {
            on_change(healthy);
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, GatewayStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::time::Duration;

    fn unreachable_settings() -> AiServiceSettings {
        AiServiceSettings {
            // Nothing listens on loopback port 1.
            host: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(200),
            retry_count: 2,
            retry_delay: Duration::ZERO,
            jpeg_quality: 85,
        }
    }

    #[test]
    fn empty_frame_is_refused_without_io() {
        let gateway = InferenceGateway::new(unreachable_settings());
        let frame = Frame::new(RgbImage::new(0, 0), "cam", 1);
        assert!(gateway.infer(&frame).is_err());
        assert_eq!(gateway.stats().total_requests, 0);
    }

    #[test]
    fn unreachable_service_exhausts_retries() {
        let gateway = InferenceGateway::new(unreachable_settings());
        assert!(!gateway.is_healthy());
        let frame = Frame::new(RgbImage::new(8, 8), "cam", 1);
        assert!(gateway.infer(&frame).is_err());
        let stats = gateway.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failed_requests, 3);
        assert!(stats.last_failure.is_some());
        assert!(stats.last_success.is_none());
    }

    #[test]
    fn latency_ema_is_seeded_by_first_sample() {
        let gateway = InferenceGateway::new(unreachable_settings());
        gateway.record(true, 100.0);
        assert_eq!(gateway.stats().avg_latency_ms, 100.0);
        gateway.record(true, 200.0);
        assert!((gateway.stats().avg_latency_ms - 110.0).abs() < 1e-9);
        gateway.record(false, 0.0);
        assert!((gateway.stats().avg_latency_ms - 110.0).abs() < 1e-9);
    }
}
