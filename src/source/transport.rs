use anyhow::Result;
use std::sync::Arc;

use super::{CaptureSettings, SourceUri};
use crate::frame::Frame;

/// One way of opening a source.
pub trait Transport: Send + Sync {
    /// Transport identifier, used in logs and probe reports.
    fn name(&self) -> &'static str;

    /// Whether this transport can attempt the URI at all.
    fn supports(&self, uri: &SourceUri) -> bool;

    /// Open the source with the given capture settings.
    fn open(&self, uri: &SourceUri, settings: &CaptureSettings) -> Result<Box<dyn FrameReader>>;
}

/// An open connection. Reads block until a frame arrives or the transport
/// gives up; the registry guarantees at most one call at a time.
pub trait FrameReader: Send {
    fn read(&mut self) -> Result<Frame>;

    /// Release the underlying device or stream. Called once, on release.
    fn close(&mut self) {}
}

/// Transports in preference order for this build.
pub fn default_transports() -> Vec<Arc<dyn Transport>> {
    let mut chain: Vec<Arc<dyn Transport>> = vec![Arc::new(super::SyntheticTransport)];
    #[cfg(feature = "rtsp-ffmpeg")]
    chain.push(Arc::new(super::ffmpeg::FfmpegTransport));
    #[cfg(feature = "rtsp-gstreamer")]
    chain.push(Arc::new(super::gstreamer::GstreamerTransport));
    #[cfg(feature = "ingest-v4l2")]
    chain.push(Arc::new(super::v4l2::V4l2Transport));
    chain.push(Arc::new(super::MjpegTransport::default()));
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_comes_first_and_http_is_always_available() -> Result<()> {
        let chain = default_transports();
        assert_eq!(chain[0].name(), "synthetic");
        let http = SourceUri::parse("http://cam.local/stream")?;
        assert!(chain.iter().any(|t| t.supports(&http)));
        Ok(())
    }
}
