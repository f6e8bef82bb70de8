//! HTTP camera source: MJPEG (`multipart/x-mixed-replace`) or JPEG snapshots.
//!
//! A multipart response is read as a continuous stream and split on JPEG SOI/EOI
//! markers; when several complete frames have arrived, only the newest is
//! decoded. Any other content type is treated as a snapshot endpoint and
//! re-fetched for every frame.

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::time::Duration;

use super::backend::{MediaReader, StreamProperties, TransportBackend};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

pub struct MjpegBackend;

impl TransportBackend for MjpegBackend {
    fn name(&self) -> &'static str {
        "http-mjpeg"
    }

    fn supports(&self, scheme: &str) -> bool {
        matches!(scheme, "http" | "https")
    }

    fn open(&self, url: &str, io_timeout: Duration) -> Result<Box<dyn MediaReader>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(io_timeout)
            .timeout_read(io_timeout)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();

        let mut body = if content_type.contains("multipart") {
            HttpBody::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpBody::Snapshot {
                agent,
                url: url.to_string(),
                first: Some(read_body(response)?),
            }
        };

        // Decode one frame up front so the negotiated resolution is known.
        let first = decode_jpeg(&body.next_jpeg()?)?;
        log::info!(
            "http source {} opened ({}x{}, {})",
            url,
            first.width(),
            first.height(),
            if matches!(body, HttpBody::Mjpeg(_)) {
                "mjpeg"
            } else {
                "snapshot"
            }
        );
        Ok(Box::new(MjpegReader {
            properties: StreamProperties {
                fps: None,
                width: first.width(),
                height: first.height(),
            },
            pending: Some(first),
            body,
        }))
    }
}

struct MjpegReader {
    properties: StreamProperties,
    pending: Option<RgbImage>,
    body: HttpBody,
}

impl MediaReader for MjpegReader {
    fn properties(&self) -> StreamProperties {
        self.properties
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        if let Some(image) = self.pending.take() {
            return Ok(image);
        }
        let bytes = self.body.next_jpeg()?;
        decode_jpeg(&bytes)
    }
}

enum HttpBody {
    Mjpeg(MjpegStream),
    Snapshot {
        agent: ureq::Agent,
        url: String,
        first: Option<Vec<u8>>,
    },
}

impl HttpBody {
    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        match self {
            HttpBody::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpBody::Snapshot { agent, url, first } => {
                if let Some(bytes) = first.take() {
                    return Ok(bytes);
                }
                let response = agent
                    .get(url)
                    .call()
                    .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
                read_body(response)
            }
        }
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        bail!("empty jpeg snapshot");
    }
    if bytes.len() > MAX_JPEG_BYTES {
        bail!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES);
    }
    Ok(bytes)
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Newest complete JPEG among the bytes received so far; older complete
    /// frames in the buffer are discarded.
    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_last_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // A runaway part without an end marker: keep only the tail.
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

/// Bounds of the last complete SOI..EOI run in `buffer`.
fn find_last_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut last = None;
    while let Some((start, end)) = find_jpeg_bounds(&buffer[offset..]) {
        last = Some((offset + start, offset + end));
        offset += end;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([90, 120, 200]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode_image(&image)
            .unwrap();
        out
    }

    #[test]
    fn finds_marker_bounds_across_noise() {
        let buffer = [0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x33];
        assert_eq!(find_jpeg_bounds(&buffer), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
        assert_eq!(find_jpeg_bounds(&[0x00, 0x01]), None);
    }

    fn part(width: u32) -> Vec<u8> {
        let mut bytes = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        bytes.extend_from_slice(&jpeg(width, 8));
        bytes.extend_from_slice(b"\r\n");
        bytes
    }

    /// Hands out one pre-cut chunk per `read` call.
    struct Chunks(Vec<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn last_marker_bounds_pick_newest_frame() {
        let buffer = [0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xFF, 0xD8, 0x02, 0xFF, 0xD9, 0xFF, 0xD8];
        assert_eq!(find_last_jpeg_bounds(&buffer), Some((5, 10)));
        assert_eq!(find_last_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }

    #[test]
    fn backlog_of_frames_yields_the_newest() -> Result<()> {
        let mut body = Vec::new();
        for width in [8, 16, 24] {
            body.extend_from_slice(&part(width));
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        let image = decode_jpeg(&stream.read_next_jpeg()?)?;
        assert_eq!(image.dimensions(), (24, 8));
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn frames_arriving_one_by_one_are_all_delivered() -> Result<()> {
        let mut stream = MjpegStream::new(Box::new(Chunks(vec![part(16), part(32)])));
        for width in [16, 32] {
            let image = decode_jpeg(&stream.read_next_jpeg()?)?;
            assert_eq!(image.dimensions(), (width, 8));
        }
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn corrupt_jpeg_is_an_error() {
        assert!(decode_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]).is_err());
    }
}
