//! Frame conditioning: quality gate, then normalization.
//!
//! `FrameConditioner::process` is stateless given its settings and may be
//! called from any thread. A frame that scores below the threshold comes back
//! with an empty payload; callers treat that as a rejection.

pub mod normalize;
pub mod quality;

pub use quality::{assess, QualityReport, QualityWeights};

use crate::config::PreprocessingSettings;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct FrameConditioner {
    settings: PreprocessingSettings,
}

impl FrameConditioner {
    pub fn new(settings: PreprocessingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PreprocessingSettings {
        &self.settings
    }

    /// Score, gate and normalize one frame.
    pub fn process(&self, mut frame: Frame) -> Frame {
        if frame.is_empty() {
            return frame;
        }

        let report = assess(frame.image(), &self.settings.quality_weights);
        frame.quality = Some(report.score);
        if report.score < self.settings.quality_threshold {
            log::debug!(
                "frame {}#{} rejected: quality {:.3} < {:.3}",
                frame.source_id,
                frame.sequence,
                report.score,
                self.settings.quality_threshold
            );
            frame.clear_payload();
            return frame;
        }

        let (tw, th) = (self.settings.target_width, self.settings.target_height);
        if frame.width() != tw || frame.height() != th {
            let (image, geometry) = if self.settings.letterbox {
                normalize::letterbox(frame.image(), tw, th)
            } else {
                normalize::resize(frame.image(), tw, th)
            };
            frame.replace_image(image, geometry);
        }

        let mut image = frame.take_image();
        normalize::apply_gamma(&mut image, self.settings.gamma);
        if self.settings.denoise {
            image = normalize::median3x3(&image);
        }
        if self.settings.sharpen {
            image = normalize::sharpen(&image);
        }
        frame.restore_image(image);
        frame
    }

    /// True when the frame came back from `process` rejected.
    pub fn is_rejected(frame: &Frame) -> bool {
        frame.is_empty()
    }
}
