//! Control/telemetry server.
//!
//! Minimal HTTP/1.1 over `TcpListener`: one request per connection, one thread
//! per accepted connection, no keep-alive.
//!
//! Routes:
//! - `GET /healthz`  200 iff the inference service is healthy AND the stream is connected
//! - `GET /status`   JSON snapshot
//! - `GET /metrics`  text exposition of gauges
//! - `POST /discover?ip=..&user=..&pass=..&brand=..` candidate stream URLs

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::TelemetrySettings;
use crate::discovery::DiscoveryError;

const MAX_REQUEST_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const METRIC_PREFIX: &str = "lpr_edge_";

/// Handler for `POST /discover`; receives the raw query string.
pub type DiscoverHandler = Arc<dyn Fn(&str) -> Result<Vec<String>, DiscoveryError> + Send + Sync>;

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

/// Values the server reports. Written by the pipeline, read by request threads.
#[derive(Default)]
pub struct TelemetryState {
    ai_healthy: AtomicBool,
    stream_connected: AtomicBool,
    fps_bits: AtomicU64,
    queue_size: AtomicU64,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl TelemetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ai_healthy(&self, healthy: bool) {
        self.ai_healthy.store(healthy, Ordering::Release);
    }

    pub fn set_stream_connected(&self, connected: bool) {
        self.stream_connected.store(connected, Ordering::Release);
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Release);
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size as u64, Ordering::Release);
    }

    /// Publish an extra gauge. Characters outside `[A-Za-z0-9_]` become `_`.
    pub fn set_gauge(&self, name: &str, value: f64) {
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.lock_gauges().insert(name, value);
    }

    pub fn ai_healthy(&self) -> bool {
        self.ai_healthy.load(Ordering::Acquire)
    }

    pub fn stream_connected(&self) -> bool {
        self.stream_connected.load(Ordering::Acquire)
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Acquire))
    }

    pub fn queue_size(&self) -> u64 {
        self.queue_size.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.ai_healthy() && self.stream_connected()
    }

    fn gauges(&self) -> BTreeMap<String, f64> {
        self.lock_gauges().clone()
    }

    fn lock_gauges(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, f64>> {
        self.gauges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    ai_service: bool,
    stream_connected: bool,
    fps: f64,
    queue_size: u64,
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

pub struct TelemetryServer {
    settings: TelemetrySettings,
    state: Arc<TelemetryState>,
    discover: Option<DiscoverHandler>,
}

#[derive(Debug)]
pub struct TelemetryHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TelemetryHandle {
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("telemetry server thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for TelemetryHandle {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            log::error!("{}", err);
        }
    }
}

impl TelemetryServer {
    pub fn new(settings: TelemetrySettings, state: Arc<TelemetryState>) -> Self {
        Self {
            settings,
            state,
            discover: None,
        }
    }

    pub fn with_discover_handler(mut self, handler: DiscoverHandler) -> Self {
        self.discover = Some(handler);
        self
    }

    /// Bind now and serve on a background thread.
    pub fn spawn(self) -> Result<TelemetryHandle> {
        let configured_addr: SocketAddr = self
            .settings
            .addr
            .parse()
            .with_context(|| format!("invalid telemetry address '{}'", self.settings.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind telemetry server on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let routes = Arc::new(Routes {
            state: self.state,
            discover: self.discover,
        });
        let join = std::thread::Builder::new()
            .name("telemetry".into())
            .spawn(move || {
                if let Err(err) = run_server(listener, routes, shutdown_thread) {
                    log::error!("telemetry server stopped: {}", err);
                }
            })
            .context("spawn telemetry thread")?;

        log::info!("telemetry server listening on {}", addr);
        Ok(TelemetryHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Routes {
    state: Arc<TelemetryState>,
    discover: Option<DiscoverHandler>,
}

fn run_server(listener: TcpListener, routes: Arc<Routes>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let routes = Arc::clone(&routes);
                let spawned = std::thread::Builder::new()
                    .name("telemetry-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &routes) {
                            log::debug!("telemetry request from {} rejected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("telemetry: cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, routes: &Routes) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#);
            return Err(err);
        }
    };

    let expected_method = match request.path.as_str() {
        "/healthz" | "/status" | "/metrics" => "GET",
        "/discover" => "POST",
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    };
    if request.method != expected_method {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/healthz" => {
            if routes.state.is_healthy() {
                write_response(&mut stream, 200, "text/plain", b"OK")
            } else {
                write_response(&mut stream, 503, "text/plain", b"Service Unavailable")
            }
        }
        "/status" => {
            let body = status_body(&routes.state);
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/metrics" => {
            let text = render_metrics(&routes.state);
            write_response(
                &mut stream,
                200,
                "text/plain; version=0.0.4",
                text.as_bytes(),
            )
        }
        _ => handle_discover(&mut stream, routes, &request.query),
    }
}

fn handle_discover(stream: &mut TcpStream, routes: &Routes, query: &str) -> Result<()> {
    let Some(handler) = routes.discover.as_ref() else {
        return write_json_response(stream, 501, r#"{"error":"discover not implemented"}"#);
    };
    let (status, body) = match handler(query) {
        Ok(candidates) => (
            200,
            serde_json::json!({ "success": true, "candidates": candidates }),
        ),
        Err(err) => (
            400,
            serde_json::json!({ "success": false, "error": err.to_string() }),
        ),
    };
    let payload = serde_json::to_vec(&body)?;
    write_response(stream, status, "application/json", &payload)
}

fn status_body(state: &TelemetryState) -> StatusBody {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    StatusBody {
        status: if state.is_healthy() {
            "healthy"
        } else {
            "unhealthy"
        },
        ai_service: state.ai_healthy(),
        stream_connected: state.stream_connected(),
        fps: state.fps(),
        queue_size: state.queue_size(),
        timestamp,
    }
}

/// Prometheus-style text exposition.
pub fn render_metrics(state: &TelemetryState) -> String {
    let mut out = String::new();
    let mut gauge = |name: &str, help: &str, value: f64| {
        let _ = writeln!(out, "# HELP {}{} {}", METRIC_PREFIX, name, help);
        let _ = writeln!(out, "# TYPE {}{} gauge", METRIC_PREFIX, name);
        let _ = writeln!(out, "{}{} {}", METRIC_PREFIX, name, value);
    };
    gauge("fps", "Current frames per second", state.fps());
    gauge("queue_size", "Current frame queue depth", state.queue_size() as f64);
    gauge(
        "ai_healthy",
        "Inference service health (1 = healthy)",
        bool_gauge(state.ai_healthy()),
    );
    gauge(
        "stream_connected",
        "Stream connection status (1 = connected)",
        bool_gauge(state.stream_connected()),
    );
    for (name, value) in state.gauges() {
        gauge(&name, "Custom metric", value);
    }
    out
}

fn bool_gauge(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: String,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let target = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        501 => "HTTP/1.1 501 Not Implemented",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_include_core_and_custom_gauges() {
        let state = TelemetryState::new();
        state.set_fps(12.5);
        state.set_queue_size(3);
        state.set_ai_healthy(true);
        state.set_gauge("frames.dropped", 7.0);

        let text = render_metrics(&state);
        assert!(text.contains("# TYPE lpr_edge_fps gauge\n"));
        assert!(text.contains("lpr_edge_fps 12.5\n"));
        assert!(text.contains("lpr_edge_queue_size 3\n"));
        assert!(text.contains("lpr_edge_ai_healthy 1\n"));
        assert!(text.contains("lpr_edge_stream_connected 0\n"));
        assert!(text.contains("lpr_edge_frames_dropped 7\n"));
    }

    #[test]
    fn status_reflects_both_flags() {
        let state = TelemetryState::new();
        state.set_ai_healthy(true);
        assert_eq!(status_body(&state).status, "unhealthy");
        state.set_stream_connected(true);
        let body = status_body(&state);
        assert_eq!(body.status, "healthy");
        assert!(body.timestamp > 0);
    }
}
