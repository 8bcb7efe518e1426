use anyhow::{anyhow, Result};
use std::thread;
use std::time::Instant;
use url::Url;

use super::transport::{FrameReader, Transport};
use super::{CaptureSettings, SourceUri, UriKind};
use crate::frame::Frame;

/// Host name of a synthetic source that never opens.
pub const OFFLINE_HOST: &str = "offline";

/// Generated test pattern for `stub://` URIs.
///
/// - `stub://offline` fails to open
/// - `stub://name?fail_after=N` serves N frames, then every read fails
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticTransport;

impl Transport for SyntheticTransport {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn supports(&self, uri: &SourceUri) -> bool {
        matches!(uri.kind(), UriKind::Synthetic)
    }

    fn open(&self, uri: &SourceUri, settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
        let url = Url::parse(uri.as_str())?;
        if url.host_str() == Some(OFFLINE_HOST) {
            return Err(anyhow!("synthetic source {} is offline", uri));
        }
        let fail_after = url
            .query_pairs()
            .find(|(k, _)| k == "fail_after")
            .map(|(_, v)| v.parse::<u64>())
            .transpose()
            .map_err(|err| anyhow!("invalid fail_after in {}: {}", uri, err))?;
        log::info!("SyntheticSource: connected to {}", uri);
        Ok(Box::new(SyntheticReader {
            settings: settings.clone(),
            fail_after,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        }))
    }
}

struct SyntheticReader {
    settings: CaptureSettings,
    fail_after: Option<u64>,
    frame_count: u64,
    /// Changes every 50 frames so consecutive frames are not all identical.
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticReader {
    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.settings.frame_interval(), self.last_frame_at)
        {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.settings.width * self.settings.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameReader for SyntheticReader {
    fn read(&mut self) -> Result<Frame> {
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("synthetic stream ended after {} frames", limit));
            }
        }
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.settings.width, self.settings.height)
    }
}
