//! Inference service wire format.
//!
//! Request: `multipart/form-data` with an `image` part (`frame.jpg`,
//! `image/jpeg`) and a `camera_id` text part.
//! Response: JSON `{plate_text, confidence, bbox, vehicle_color?, vehicle_type?}`
//! where `bbox` is either `{x1,y1,x2,y2}` or `{x,y,w,h}`.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;

/// Encode an RGB frame as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode frame as jpeg")?;
    Ok(out)
}

/// A ready-to-send multipart body.
pub struct MultipartBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub fn multipart_body(jpeg: &[u8], camera_id: &str) -> MultipartBody {
    let boundary = format!("lpr-edge-{:016x}", rand::random::<u64>());
    let mut bytes = Vec::with_capacity(jpeg.len() + 512);

    bytes.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    bytes.extend_from_slice(
        b"Content-Disposition: form-data; name=\"image\"; filename=\"frame.jpg\"\r\n",
    );
    bytes.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    bytes.extend_from_slice(jpeg);
    bytes.extend_from_slice(b"\r\n");

    bytes.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    bytes.extend_from_slice(b"Content-Disposition: form-data; name=\"camera_id\"\r\n\r\n");
    bytes.extend_from_slice(camera_id.as_bytes());
    bytes.extend_from_slice(b"\r\n");

    bytes.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    MultipartBody {
        content_type: format!("multipart/form-data; boundary={}", boundary),
        bytes,
    }
}

#[derive(Debug, Deserialize)]
pub struct WireResult {
    #[serde(default)]
    pub plate_text: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub bbox: Option<WireBox>,
    #[serde(default)]
    pub vehicle_color: Option<String>,
    #[serde(default)]
    pub vehicle_type: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireBox {
    Corners { x1: f64, y1: f64, x2: f64, y2: f64 },
    Rect { x: f64, y: f64, w: f64, h: f64 },
}

impl WireBox {
    /// `(x, y, width, height)` in the coordinates of the image that was sent.
    pub fn to_rect(self) -> (f64, f64, f64, f64) {
        match self {
            WireBox::Corners { x1, y1, x2, y2 } => (x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0)),
            WireBox::Rect { x, y, w, h } => (x, y, w.max(0.0), h.max(0.0)),
        }
    }
}

pub fn parse_response(body: &str) -> Result<WireResult> {
    let mut result: WireResult =
        serde_json::from_str(body).context("parse inference response")?;
    result.confidence = result.confidence.clamp(0.0, 1.0);
    result.vehicle_color = result.vehicle_color.filter(|v| !v.is_empty());
    result.vehicle_type = result.vehicle_type.filter(|v| !v.is_empty());
    Ok(result)
}
