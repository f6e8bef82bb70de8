//! GStreamer transport (feature `rtsp-gstreamer`).
//!
//! Pipeline: `rtspsrc`/`uridecodebin` -> `decodebin` -> `videoconvert` ->
//! `appsink` configured with `max-buffers=1 drop=true` so a slow consumer always
//! sees the newest frame.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;
use std::time::Duration;

use super::backend::{frame_timeout, MediaReader, StreamProperties, TransportBackend};

/// Wait for the first decoded sample when opening.
const FIRST_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GstreamerBackend;

impl TransportBackend for GstreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn supports(&self, scheme: &str) -> bool {
        matches!(scheme, "rtsp" | "rtsps" | "http" | "https" | "file")
    }

    fn open(&self, url: &str, io_timeout: Duration) -> Result<Box<dyn MediaReader>> {
        gstreamer::init().context("initialize gstreamer")?;

        let source = if url.starts_with("rtsp") {
            format!(
                "rtspsrc location={} latency=0 tcp-timeout={} ! decodebin",
                url,
                io_timeout.as_micros()
            )
        } else {
            format!("uridecodebin uri={}", url)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build gstreamer pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("gstreamer pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set gstreamer pipeline to Playing")?;

        let mut reader = GstreamerReader {
            pipeline,
            appsink,
            properties: StreamProperties::default(),
            pending: None,
        };
        let sample = reader
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                FIRST_SAMPLE_TIMEOUT.as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("no frame from {} within {:?}", url, FIRST_SAMPLE_TIMEOUT))?;
        let (image, properties) = sample_to_image(&sample)?;
        reader.properties = properties;
        reader.pending = Some(image);
        log::info!(
            "gstreamer opened {} ({}x{} @ {:?} fps)",
            url,
            properties.width,
            properties.height,
            properties.fps
        );
        Ok(Box::new(reader))
    }
}

struct GstreamerReader {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    properties: StreamProperties,
    pending: Option<RgbImage>,
}

impl GstreamerReader {
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached end of stream")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl MediaReader for GstreamerReader {
    fn properties(&self) -> StreamProperties {
        self.properties
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        if let Some(image) = self.pending.take() {
            return Ok(image);
        }
        self.check_bus()?;
        let timeout = frame_timeout(self.properties.fps);
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("gstreamer stream stalled"))?;
        let (image, _) = sample_to_image(&sample)?;
        Ok(image)
    }
}

impl Drop for GstreamerReader {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop gstreamer pipeline: {}", err);
        }
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<(RgbImage, StreamProperties)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let fps = info.fps();
    let fps = if fps.denom() > 0 && fps.numer() > 0 {
        Some(fps.numer() as f64 / fps.denom() as f64)
    } else {
        None
    };

    let map = buffer.map_readable().context("map gstreamer buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("gstreamer buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("gstreamer buffer row is out of bounds")?,
            );
        }
        pixels
    };

    let image = RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("gstreamer frame size mismatch"))?;
    Ok((
        image,
        StreamProperties {
            fps,
            width,
            height,
        },
    ))
}
