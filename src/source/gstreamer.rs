use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::transport::{FrameReader, Transport};
use super::{CaptureSettings, SourceUri, UriKind};
use crate::frame::Frame;

/// RTSP, HTTP and file sources decoded by GStreamer into RGB.
pub struct GstreamerTransport;

impl GstreamerTransport {
    fn describe(uri: &SourceUri, settings: &CaptureSettings) -> Result<String> {
        let head = match uri.kind() {
            UriKind::Rtsp(url) => format!("rtspsrc location={} latency=0 ! decodebin", url),
            UriKind::Http(url) => format!("uridecodebin uri={}", url),
            UriKind::File(path) => format!("filesrc location={} ! decodebin", path),
            _ => return Err(anyhow!("gstreamer cannot open {}", uri)),
        };
        let mut caps = format!(
            "video/x-raw,format=RGB,width={},height={}",
            settings.width, settings.height
        );
        if settings.fps > 0 {
            caps.push_str(&format!(",framerate={}/1", settings.fps));
        }
        Ok(format!(
            "{} ! videoconvert ! videoscale ! videorate ! {} ! \
             appsink name=appsink sync=false max-buffers={} drop=true",
            head,
            caps,
            settings.buffer_frames.max(1)
        ))
    }
}

impl Transport for GstreamerTransport {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn supports(&self, uri: &SourceUri) -> bool {
        matches!(
            uri.kind(),
            UriKind::Rtsp(_) | UriKind::Http(_) | UriKind::File(_)
        )
    }

    fn open(&self, uri: &SourceUri, settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = Self::describe(uri, settings)?;
        let pipeline = gstreamer::parse::launch(&description)
            .context("build gstreamer pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("gstreamer pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(settings.buffer_frames.max(1).into());
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set gstreamer pipeline to Playing")?;
        log::info!("GstreamerSource: connected to {}", uri);

        Ok(Box::new(GstreamerReader {
            uri: uri.as_str().to_string(),
            fps: settings.fps,
            pipeline,
            appsink,
            frame_count: 0,
            connected_at: Instant::now(),
        }))
    }
}

struct GstreamerReader {
    uri: String,
    fps: u32,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    connected_at: Instant,
}

impl GstreamerReader {
    fn frame_timeout(&self) -> Duration {
        // The first sample waits for RTSP negotiation.
        if self.frame_count == 0 {
            return Duration::from_secs(5);
        }
        let base_ms = if self.fps == 0 {
            500
        } else {
            (1000 / self.fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
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

impl FrameReader for GstreamerReader {
    fn read(&mut self) -> Result<Frame> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("stream {} stalled", self.uri))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::from_rgb(pixels, width, height)
    }

    fn close(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: failed to stop {}: {}", self.uri, err);
        }
        log::debug!(
            "GstreamerSource: closed {} after {} frames in {:?}",
            self.uri,
            self.frame_count,
            self.connected_at.elapsed()
        );
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let frame = data
            .get(..row_bytes * height as usize)
            .context("buffer shorter than frame")?;
        return Ok((frame.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }
    Ok((pixels, width, height))
}
