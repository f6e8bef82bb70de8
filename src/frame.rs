//! Frame and result types that flow through the pipeline.
//!
//! - `Frame`: an owned image plus capture metadata. Not `Clone`; a frame moves
//!   from stage to stage and is owned by exactly one stage at a time.
//! - `FrameGeometry`: how the current pixels map back onto the source frame.
//! - `InferenceResult`: what the inference gateway returns for one frame.
//!
//! An empty payload (0x0 image) marks a frame the conditioner rejected.

use image::RgbImage;
use serde::Serialize;
use std::time::SystemTime;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured video frame.
///
/// Deliberately NOT implementing `Clone`: frames are handed off by move through
/// the queues and are never aliased across threads.
pub struct Frame {
    image: RgbImage,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Camera / source identifier.
    pub source_id: String,
    /// Per-ingestor sequence number. Gaps appear when frames are dropped.
    pub sequence: u64,
    /// Quality score assigned by the conditioner, if it has seen the frame.
    pub quality: Option<f64>,
    /// Mapping from current pixel coordinates back to the captured frame.
    pub geometry: FrameGeometry,
}

impl Frame {
    pub fn new(image: RgbImage, source_id: impl Into<String>, sequence: u64) -> Self {
        let geometry = FrameGeometry::identity(image.width(), image.height());
        Self {
            image,
            captured_at: SystemTime::now(),
            source_id: source_id.into(),
            sequence,
            quality: None,
            geometry,
        }
    }

    /// Build a frame from packed RGB24 bytes. Returns `None` when the buffer
    /// length does not match the dimensions.
    pub fn from_rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        source_id: impl Into<String>,
        sequence: u64,
    ) -> Option<Self> {
        let image = RgbImage::from_raw(width, height, pixels)?;
        Some(Self::new(image, source_id, sequence))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// True when the payload has been cleared (rejected) or was never filled.
    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Raw byte length of the payload.
    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }

    /// Swap in a new payload, composing `geometry` onto the existing mapping.
    pub(crate) fn replace_image(&mut self, image: RgbImage, geometry: FrameGeometry) {
        self.geometry = self.geometry.then(geometry);
        self.image = image;
    }

    /// Move the payload out for in-place filtering; pair with `restore_image`.
    pub(crate) fn take_image(&mut self) -> RgbImage {
        std::mem::replace(&mut self.image, RgbImage::new(0, 0))
    }

    /// Put back a same-geometry payload taken with `take_image`.
    pub(crate) fn restore_image(&mut self, image: RgbImage) {
        self.image = image;
    }

    /// Drop the payload, keeping metadata so the caller can account for it.
    pub(crate) fn clear_payload(&mut self) {
        self.image = RgbImage::new(0, 0);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel data is intentionally left out of debug output.
        f.debug_struct("Frame")
            .field("source_id", &self.source_id)
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("quality", &self.quality)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Geometry
// ----------------------------------------------------------------------------

/// Affine mapping `current = source * scale + offset`, per axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameGeometry {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    /// Dimensions of the frame as captured.
    pub source_width: u32,
    pub source_height: u32,
}

impl FrameGeometry {
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            source_width: width,
            source_height: height,
        }
    }

    /// Compose: apply `self` first, then `next`. Source dimensions stay those of `self`.
    pub fn then(self, next: FrameGeometry) -> FrameGeometry {
        FrameGeometry {
            scale_x: self.scale_x * next.scale_x,
            scale_y: self.scale_y * next.scale_y,
            offset_x: self.offset_x * next.scale_x + next.offset_x,
            offset_y: self.offset_y * next.scale_y + next.offset_y,
            source_width: self.source_width,
            source_height: self.source_height,
        }
    }

    /// Map a box in current coordinates back into source-frame pixels,
    /// clamped to the source bounds.
    pub fn to_source(&self, x: f64, y: f64, width: f64, height: f64) -> BoundingBox {
        let sx = if self.scale_x > 0.0 { self.scale_x } else { 1.0 };
        let sy = if self.scale_y > 0.0 { self.scale_y } else { 1.0 };
        let max_x = self.source_width as f64;
        let max_y = self.source_height as f64;

        let x1 = ((x - self.offset_x) / sx).clamp(0.0, max_x);
        let y1 = ((y - self.offset_y) / sy).clamp(0.0, max_y);
        let x2 = ((x + width - self.offset_x) / sx).clamp(0.0, max_x);
        let y2 = ((y + height - self.offset_y) / sy).clamp(0.0, max_y);

        BoundingBox {
            x: x1.round() as i32,
            y: y1.round() as i32,
            width: (x2 - x1).max(0.0).round() as i32,
            height: (y2 - y1).max(0.0).round() as i32,
        }
    }
}

// ----------------------------------------------------------------------------
// Inference results
// ----------------------------------------------------------------------------

/// Axis-aligned box in source-frame pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Plate read for one frame.
#[derive(Clone, Debug, Serialize)]
pub struct InferenceResult {
    pub plate_text: String,
    /// 0.0..=1.0
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub vehicle_color: Option<String>,
    pub vehicle_type: Option<String>,
    /// Echoed from the originating frame.
    pub captured_at: SystemTime,
    pub source_id: String,
    pub sequence: u64,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
