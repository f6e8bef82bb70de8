//! In-process HTTP endpoint standing in for the inference service.
#![allow(dead_code)]

use anyhow::Result;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub const PLATE_BODY: &str =
    r#"{"plate_text":"KA01AB1234","confidence":0.92,"bbox":{"x":10,"y":20,"w":100,"h":40},"vehicle_type":"car"}"#;

#[derive(Clone, Debug)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: r#"{"error":"scripted"}"#.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Script {
    infer: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    healthy: AtomicBool,
    infer_calls: AtomicU64,
    health_calls: AtomicU64,
}

/// Serves `GET /healthz` and `POST /infer`. Scripted infer replies are used
/// in order, then `fallback` for every later call.
pub struct MockService {
    pub addr: SocketAddr,
    script: Arc<Script>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MockService {
    pub fn start(scripted: Vec<Reply>, fallback: Reply) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let script = Arc::new(Script {
            infer: Mutex::new(scripted.into()),
            fallback,
            healthy: AtomicBool::new(true),
            infer_calls: AtomicU64::new(0),
            health_calls: AtomicU64::new(0),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_script = Arc::clone(&script);
        let thread_shutdown = Arc::clone(&shutdown);
        let join = std::thread::spawn(move || {
            while !thread_shutdown.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let script = Arc::clone(&thread_script);
                        std::thread::spawn(move || {
                            let _ = serve(stream, &script);
                        });
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(5)),
                }
            }
        });

        Ok(Self {
            addr,
            script,
            shutdown,
            join: Some(join),
        })
    }

    pub fn healthy_plate_reader() -> Result<Self> {
        Self::start(Vec::new(), Reply::ok(PLATE_BODY))
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.script.healthy.store(healthy, Ordering::Release);
    }

    pub fn infer_calls(&self) -> u64 {
        self.script.infer_calls.load(Ordering::Acquire)
    }

    pub fn health_calls(&self) -> u64 {
        self.script.health_calls.load(Ordering::Acquire)
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve(mut stream: TcpStream, script: &Script) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let (head, _body) = read_request(&mut stream)?;
    let request_line = head.lines().next().unwrap_or_default().to_string();

    let reply = if request_line.starts_with("GET /healthz") {
        script.health_calls.fetch_add(1, Ordering::AcqRel);
        if script.healthy.load(Ordering::Acquire) {
            Reply::ok(r#"{"status":"ok"}"#)
        } else {
            Reply::status(503)
        }
    } else if request_line.starts_with("POST /infer") {
        script.infer_calls.fetch_add(1, Ordering::AcqRel);
        let next = script
            .infer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        next.unwrap_or_else(|| script.fallback.clone())
    } else {
        Reply::status(404)
    };

    if !reply.delay.is_zero() {
        std::thread::sleep(reply.delay);
    }
    let response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            anyhow::bail!("connection closed before headers");
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Ok((head, body))
}

/// Send one raw request and return `(status, body)`.
pub fn http_request(addr: SocketAddr, method: &str, target: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, target
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed response: {:?}", response))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("missing status in {:?}", head))?;
    Ok((status, body.to_string()))
}
