use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::transport::{FrameReader, Transport};
use super::{CaptureSettings, SourceUri, UriKind};
use crate::frame::Frame;

/// RTSP, HTTP and file sources demuxed and decoded by FFmpeg.
pub struct FfmpegTransport;

impl Transport for FfmpegTransport {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn supports(&self, uri: &SourceUri) -> bool {
        matches!(
            uri.kind(),
            UriKind::Rtsp(_) | UriKind::Http(_) | UriKind::File(_)
        )
    }

    fn open(&self, uri: &SourceUri, settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        if matches!(uri.kind(), UriKind::Rtsp(_)) {
            options.set("rtsp_transport", "tcp");
        }
        options.set("fflags", "nobuffer");
        options.set("stimeout", "5000000");

        let input = ffmpeg::format::input_with_dictionary(&uri.location(), options)
            .with_context(|| format!("failed to open '{}' with ffmpeg", uri))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", uri))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            settings.width,
            settings.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("FfmpegSource: connected to {}", uri);
        Ok(Box::new(FfmpegReader {
            uri: uri.as_str().to_string(),
            input,
            stream_index,
            decoder,
            scaler,
        }))
    }
}

struct FfmpegReader {
    uri: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

// The FFmpeg contexts hold raw pointers. A reader is only ever driven by one
// thread at a time, under the handle lock.
unsafe impl Send for FfmpegReader {}

impl FrameReader for FfmpegReader {
    fn read(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return Frame::from_rgb(pixels, width, height);
            }
        }
        Err(anyhow!("{} ended without frames", self.uri))
    }

    fn close(&mut self) {
        if let Err(err) = self.decoder.send_eof() {
            log::debug!("FfmpegSource: eof on {}: {}", self.uri, err);
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
