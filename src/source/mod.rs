//! Video sources.
//!
//! `SourceRegistry` owns one `SourceHandle` per source id and is the only way
//! the rest of the crate touches a camera. Handles are opened through an
//! ordered chain of `Transport`s:
//! - synthetic `stub://` test patterns
//! - FFmpeg (feature: rtsp-ffmpeg)
//! - GStreamer (feature: rtsp-gstreamer)
//! - V4L2 local devices (feature: ingest-v4l2)
//! - HTTP MJPEG / snapshot endpoints
//!
//! Sources MUST NOT write frames to disk. Frames leave the registry only as
//! in-memory `Frame`s or as a single encoded capture.

#[cfg(feature = "rtsp-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer;
mod mjpeg;
pub(crate) mod registry;
mod synthetic;
mod transport;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use url::Url;

pub use mjpeg::MjpegTransport;
pub use registry::{ProbeOutcome, ProbeReport, SourceHandle, SourceRegistry, SourceSnapshot};
pub use synthetic::SyntheticTransport;
pub use transport::{default_transports, FrameReader, Transport};

/// Consecutive read failures before a handle is declared unhealthy.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

/// Pause between release and re-acquire on `restart`.
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Handle lifecycle.
///
/// `Unopened -> Opening -> {Open, Failed}`, `Open -> Streaming` on the first
/// good read, `{Open, Streaming} -> Unhealthy` once the error threshold is
/// reached, and any open state `-> Closed` on release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Unopened,
    Opening,
    Open,
    Failed,
    Streaming,
    Unhealthy,
    Closed,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Unopened => "unopened",
            SourceState::Opening => "opening",
            SourceState::Open => "open",
            SourceState::Failed => "failed",
            SourceState::Streaming => "streaming",
            SourceState::Unhealthy => "unhealthy",
            SourceState::Closed => "closed",
        }
    }

    /// States in which reads are attempted.
    pub fn is_readable(&self) -> bool {
        matches!(self, SourceState::Open | SourceState::Streaming)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture settings applied when a transport opens a source.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Frames buffered by the transport. 1 keeps reads close to live.
    pub buffer_frames: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Require a test frame before a transport counts as opened.
    pub probe_on_open: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_frames: 1,
            width: 640,
            height: 480,
            fps: 30,
            probe_on_open: true,
        }
    }
}

impl CaptureSettings {
    /// Interval between frames at the configured rate, if any.
    pub fn frame_interval(&self) -> Option<Duration> {
        if self.fps == 0 {
            None
        } else {
            Some(Duration::from_micros(1_000_000 / self.fps as u64))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UriKind {
    /// `stub://name[?fail_after=N]`
    Synthetic,
    /// Local capture device, normalized to `/dev/videoN`.
    Device { path: String, index: Option<u32> },
    Http(Url),
    Rtsp(Url),
    /// Local video file.
    File(String),
}

/// Parsed source URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUri {
    raw: String,
    kind: UriKind,
}

impl SourceUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty source uri"));
        }
        let kind = if raw.starts_with("stub://") {
            UriKind::Synthetic
        } else if let Ok(index) = raw.parse::<u32>() {
            UriKind::Device {
                path: format!("/dev/video{}", index),
                index: Some(index),
            }
        } else if let Some(rest) = raw.strip_prefix("/dev/video") {
            UriKind::Device {
                path: raw.to_string(),
                index: rest.parse().ok(),
            }
        } else {
            match Url::parse(raw) {
                Ok(url) => match url.scheme() {
                    "http" | "https" => UriKind::Http(url),
                    "rtsp" | "rtsps" => UriKind::Rtsp(url),
                    "file" => UriKind::File(url.path().to_string()),
                    other => return Err(anyhow!("unsupported source scheme '{}'", other)),
                },
                Err(url::ParseError::RelativeUrlWithoutBase) => UriKind::File(raw.to_string()),
                Err(err) => {
                    return Err(err).with_context(|| format!("invalid source uri '{}'", raw))
                }
            }
        };
        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &UriKind {
        &self.kind
    }

    /// URI as given to network and file transports.
    pub fn location(&self) -> &str {
        match &self.kind {
            UriKind::Device { path, .. } => path,
            UriKind::File(path) => path,
            _ => &self.raw,
        }
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_indices_and_paths() -> Result<()> {
        let uri = SourceUri::parse("0")?;
        assert_eq!(
            uri.kind(),
            &UriKind::Device {
                path: "/dev/video0".to_string(),
                index: Some(0)
            }
        );
        assert_eq!(uri.location(), "/dev/video0");

        let uri = SourceUri::parse("/dev/video2")?;
        assert!(matches!(uri.kind(), UriKind::Device { index: Some(2), .. }));
        Ok(())
    }

    #[test]
    fn parses_network_schemes() -> Result<()> {
        assert!(matches!(
            SourceUri::parse("rtsp://10.0.0.5:554/stream1")?.kind(),
            UriKind::Rtsp(_)
        ));
        assert!(matches!(
            SourceUri::parse("http://cam.local/mjpeg")?.kind(),
            UriKind::Http(_)
        ));
        assert_eq!(SourceUri::parse("stub://gate")?.kind(), &UriKind::Synthetic);
        assert_eq!(
            SourceUri::parse("clips/yard.mp4")?.kind(),
            &UriKind::File("clips/yard.mp4".to_string())
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_schemes_and_empty_input() {
        assert!(SourceUri::parse("").is_err());
        assert!(SourceUri::parse("ftp://cam/stream").is_err());
    }

    #[test]
    fn frame_interval_follows_fps() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.frame_interval(), Some(Duration::from_micros(33_333)));
        let unpaced = CaptureSettings {
            fps: 0,
            ..CaptureSettings::default()
        };
        assert_eq!(unpaced.frame_interval(), None);
    }
}
