//! Synthetic source for `stub://` URLs.
//!
//! Produces deterministic, high-texture RGB frames so the whole pipeline can
//! run without a camera. Query parameters tune the stream:
//! `stub://gate?width=640&height=360&fps=25&fail_after=100`.

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use std::time::Duration;
use url::Url;

use super::backend::{MediaReader, StreamProperties, TransportBackend};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 360;
const DEFAULT_FPS: f64 = 30.0;
const CELL: u32 = 16;

pub struct SyntheticBackend;

impl TransportBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn supports(&self, scheme: &str) -> bool {
        scheme == "stub"
    }

    fn open(&self, url: &str, _io_timeout: Duration) -> Result<Box<dyn MediaReader>> {
        let reader = SyntheticReader::from_url(url)?;
        log::info!(
            "synthetic source {} opened ({}x{})",
            url,
            reader.width,
            reader.height
        );
        Ok(Box::new(reader))
    }
}

pub(crate) struct SyntheticReader {
    width: u32,
    height: u32,
    fps: f64,
    fail_after: Option<u64>,
    frame_count: u64,
}

impl SyntheticReader {
    fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).context("parse stub url")?;
        let mut reader = Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            fail_after: None,
            frame_count: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => reader.width = parse_param(&key, &value)?,
                "height" => reader.height = parse_param(&key, &value)?,
                "fps" => reader.fps = parse_param(&key, &value)?,
                "fail_after" => reader.fail_after = Some(parse_param(&key, &value)?),
                other => log::debug!("synthetic source ignoring parameter '{}'", other),
            }
        }
        if reader.width == 0 || reader.height == 0 {
            bail!("stub frame dimensions must be non-zero");
        }
        Ok(reader)
    }

    fn render(&self) -> RgbImage {
        let shift = self.frame_count as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let cell = ((x + shift) / CELL + y / CELL) % 2;
            let base = if cell == 0 { 40u8 } else { 215u8 };
            let tint = ((x * 255) / self.width.max(1)) as u8;
            Rgb([base, base.saturating_sub(tint / 8), base / 2 + tint / 4])
        })
    }
}

impl MediaReader for SyntheticReader {
    fn properties(&self) -> StreamProperties {
        StreamProperties {
            fps: Some(self.fps),
            width: self.width,
            height: self.height,
        }
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                bail!("synthetic stream ended after {} frames", limit);
            }
        }
        let image = self.render();
        self.frame_count += 1;
        Ok(image)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub parameter {}={}", key, value))
}
