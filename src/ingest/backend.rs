//! Transport backend seam.
//!
//! A `TransportBackend` knows how to open a media URL; the `MediaReader` it
//! returns yields decoded RGB frames one at a time. The ingestor tries backends
//! in order and owns the reader for the lifetime of one connection.

use anyhow::Result;
use image::RgbImage;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Properties negotiated when a connection opens.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamProperties {
    /// Source frame rate, when the transport reports one.
    pub fps: Option<f64>,
    pub width: u32,
    pub height: u32,
}

pub trait TransportBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this backend handles URLs with `scheme`.
    fn supports(&self, scheme: &str) -> bool;

    /// Open `url`. May block; the ingestor bounds each call with a watchdog.
    /// `io_timeout` bounds every later network read of the returned reader.
    fn open(&self, url: &str, io_timeout: Duration) -> Result<Box<dyn MediaReader>>;
}

pub trait MediaReader: Send {
    fn properties(&self) -> StreamProperties;

    /// Read and decode the next frame. An error ends the connection.
    fn read_frame(&mut self) -> Result<RgbImage>;
}

/// Backends compiled into this build, in preference order.
pub fn default_backends() -> Vec<Arc<dyn TransportBackend>> {
    let mut backends: Vec<Arc<dyn TransportBackend>> = Vec::new();
    #[cfg(feature = "rtsp-ffmpeg")]
    backends.push(Arc::new(super::ffmpeg::FfmpegBackend));
    #[cfg(feature = "rtsp-gstreamer")]
    backends.push(Arc::new(super::gstreamer::GstreamerBackend));
    backends.push(Arc::new(super::mjpeg::MjpegBackend));
    backends.push(Arc::new(super::synthetic::SyntheticBackend));
    backends
}

/// True when some backend compiled into this build handles `scheme`.
pub fn scheme_supported(scheme: &str) -> bool {
    default_backends().iter().any(|backend| backend.supports(scheme))
}

/// Longest wait for a single frame before a live connection counts as stalled.
pub(crate) fn frame_timeout(fps: Option<f64>) -> std::time::Duration {
    let interval_ms = match fps {
        Some(fps) if fps > 0.0 => (1000.0 / fps) as u64,
        _ => 125,
    };
    std::time::Duration::from_millis(interval_ms.saturating_mul(4).max(500))
}

/// Single-frame hand-off between a decode thread and its reader.
///
/// A newly published frame replaces one that was never taken, so the reader
/// always gets the most recent decode. Closing the slot tells the producer
/// its reader is gone.
pub(crate) struct LatestFrame {
    state: Mutex<SlotState>,
    ready: Condvar,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Result<RgbImage>>,
    closed: bool,
}

impl LatestFrame {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `frame`, replacing any unread one. Returns false once closed.
    pub(crate) fn publish(&self, frame: Result<RgbImage>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.frame = Some(frame);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for a frame. `None` on timeout or after close.
    pub(crate) fn take_timeout(&self, timeout: Duration) -> Option<Result<RgbImage>> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.frame.is_none() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.frame.take()
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_and_http_are_always_available() {
        let backends = default_backends();
        assert!(backends.iter().any(|b| b.supports("stub")));
        assert!(backends.iter().any(|b| b.supports("http")));
        assert!(backends.iter().any(|b| b.supports("https")));
        // Synthetic source is the last resort.
        assert_eq!(backends.last().map(|b| b.name()), Some("synthetic"));
    }

    #[test]
    fn frame_timeout_has_floor() {
        assert_eq!(frame_timeout(Some(30.0)).as_millis(), 500);
        assert_eq!(frame_timeout(Some(1.0)).as_millis(), 4000);
        assert_eq!(frame_timeout(None).as_millis(), 500);
    }

    #[test]
    fn latest_frame_keeps_newest_unread_decode() {
        let slot = LatestFrame::new();
        for width in [8, 16, 24] {
            assert!(slot.publish(Ok(RgbImage::new(width, 4))));
        }
        let frame = slot.take_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(frame.width(), 24);
        assert!(slot.take_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn latest_frame_wakes_waiting_reader() {
        let slot = Arc::new(LatestFrame::new());
        let producer = Arc::clone(&slot);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.publish(Ok(RgbImage::new(5, 5)))
        });
        let frame = slot.take_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(frame.width(), 5);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn closed_slot_refuses_producer() {
        let slot = LatestFrame::new();
        slot.close();
        assert!(slot.is_closed());
        assert!(!slot.publish(Ok(RgbImage::new(1, 1))));
        assert!(slot.take_timeout(Duration::from_millis(10)).is_none());
    }
}
