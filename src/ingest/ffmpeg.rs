//! FFmpeg transport (feature `rtsp-ffmpeg`).
//!
//! The FFmpeg demuxer, decoder and scaler live on a dedicated decode thread;
//! decoded frames cross to the capture thread through a `LatestFrame` slot,
//! so a slow reader always gets the newest decode. Every network read is
//! bounded by the connection's I/O timeout, and the decode thread exits once
//! its reader is dropped.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{frame_timeout, LatestFrame, MediaReader, StreamProperties, TransportBackend};

pub struct FfmpegBackend;

impl TransportBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn supports(&self, scheme: &str) -> bool {
        matches!(scheme, "rtsp" | "rtsps" | "http" | "https" | "file")
    }

    fn open(&self, url: &str, io_timeout: Duration) -> Result<Box<dyn MediaReader>> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let (opened_tx, opened_rx) = mpsc::channel::<Result<StreamProperties>>();
        let slot = Arc::new(LatestFrame::new());
        let decoder_slot = Arc::clone(&slot);
        let target = url.to_string();
        std::thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || decode_thread(target, io_timeout, opened_tx, decoder_slot))
            .context("spawn ffmpeg decode thread")?;

        let properties = match opened_rx.recv() {
            Ok(Ok(properties)) => properties,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(anyhow!("ffmpeg decode thread exited during open")),
        };
        log::info!(
            "ffmpeg opened {} ({}x{} @ {:?} fps)",
            url,
            properties.width,
            properties.height,
            properties.fps
        );
        Ok(Box::new(FfmpegReader { properties, slot }))
    }
}

struct FfmpegReader {
    properties: StreamProperties,
    slot: Arc<LatestFrame>,
}

impl MediaReader for FfmpegReader {
    fn properties(&self) -> StreamProperties {
        self.properties
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        self.slot
            .take_timeout(frame_timeout(self.properties.fps))
            .unwrap_or_else(|| Err(anyhow!("ffmpeg stream stalled")))
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        self.slot.close();
    }
}

struct Decoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

fn open_input(url: &str, io_timeout: Duration) -> Result<(Decoder, StreamProperties)> {
    // Both options are in microseconds; `timeout` covers the RTSP socket and
    // `rw_timeout` every other protocol.
    let micros = io_timeout.as_micros().max(1).to_string();
    let mut options = ffmpeg::Dictionary::new();
    if url.starts_with("rtsp") {
        options.set("rtsp_transport", "tcp");
    }
    options.set("timeout", &micros);
    options.set("rw_timeout", &micros);
    options.set("fflags", "nobuffer");
    options.set("flags", "low_delay");

    let input = ffmpeg::format::input_with_dictionary(&url, options)
        .with_context(|| format!("open '{}' with ffmpeg", url))?;
    let stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| anyhow!("'{}' has no video track", url))?;
    let stream_index = stream.index();
    let rate = stream.avg_frame_rate();
    let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
        Some(rate.numerator() as f64 / rate.denominator() as f64)
    } else {
        None
    };
    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("load video decoder parameters")?;
    let decoder = context
        .decoder()
        .video()
        .context("open ffmpeg video decoder")?;

    let scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .context("create ffmpeg scaler")?;

    let properties = StreamProperties {
        fps,
        width: decoder.width(),
        height: decoder.height(),
    };
    Ok((
        Decoder {
            input,
            stream_index,
            decoder,
            scaler,
        },
        properties,
    ))
}

fn decode_thread(
    url: String,
    io_timeout: Duration,
    opened: mpsc::Sender<Result<StreamProperties>>,
    slot: Arc<LatestFrame>,
) {
    let mut state = match open_input(&url, io_timeout) {
        Ok((state, properties)) => {
            if opened.send(Ok(properties)).is_err() {
                return;
            }
            state
        }
        Err(err) => {
            let _ = opened.send(Err(err));
            return;
        }
    };

    let mut decoded = ffmpeg::frame::Video::empty();
    let mut rgb = ffmpeg::frame::Video::empty();
    while !slot.is_closed() {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut state.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                slot.publish(Err(anyhow!("ffmpeg input ended")));
                return;
            }
            Err(err) => {
                slot.publish(Err(anyhow!("ffmpeg read error: {}", err)));
                return;
            }
        }
        if packet.stream() != state.stream_index {
            continue;
        }
        if let Err(err) = state.decoder.send_packet(&packet) {
            slot.publish(Err(anyhow!("ffmpeg decode error: {}", err)));
            return;
        }
        while state.decoder.receive_frame(&mut decoded).is_ok() {
            let image = state
                .scaler
                .run(&decoded, &mut rgb)
                .context("scale frame to RGB")
                .and_then(|()| frame_to_image(&rgb));
            if !slot.publish(image) {
                return;
            }
        }
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    RgbImage::from_raw(width, height, pixels).ok_or_else(|| anyhow!("ffmpeg frame size mismatch"))
}
