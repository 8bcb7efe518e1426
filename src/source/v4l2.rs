use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::transport::{FrameReader, Transport};
use super::{CaptureSettings, SourceUri, UriKind};
use crate::frame::Frame;

/// Local capture devices (`/dev/videoN` or a bare index).
pub struct V4l2Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelFormat {
    Rgb24,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: &v4l::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl Transport for V4l2Transport {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn supports(&self, uri: &SourceUri) -> bool {
        matches!(uri.kind(), UriKind::Device { .. })
    }

    fn open(&self, uri: &SourceUri, settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = uri.location().to_string();
        let device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc)
            .ok_or_else(|| anyhow!("{} delivers unsupported format {}", path, format.fourcc))?;

        if settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", path, err);
            }
        }

        let buffers = settings.buffer_frames.max(1);
        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffers)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            path,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Box::new(V4l2Reader {
            path,
            state: Some(state),
            width: format.width,
            height: format.height,
            pixel_format,
        }))
    }
}

struct V4l2Reader {
    path: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl FrameReader for V4l2Reader {
    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} is closed", self.path))?;
        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        state.with_stream_mut(|stream| {
            let (buf, meta) = stream.next().context("capture v4l2 frame")?;
            let used = (meta.bytesused as usize).min(buf.len());
            let buf = &buf[..used];
            match pixel_format {
                PixelFormat::Rgb24 => Frame::from_rgb(buf.to_vec(), width, height),
                PixelFormat::Nv12 => Frame::from_rgb(nv12_to_rgb(buf, width, height)?, width, height),
                PixelFormat::Mjpeg => Frame::decode(buf),
            }
        })
    }

    fn close(&mut self) {
        self.state = None;
        log::info!("V4l2Source: closed {}", self.path);
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane + y_plane / 2;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame too short: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(y + 1.402 * v);
            rgb[offset + 1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
            rgb[offset + 2] = clamp_to_u8(y + 1.772 * u);
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
