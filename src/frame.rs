//! Captured frames.
//!
//! - `Frame`: RGB24 pixels plus dimensions and capture instant. Pixels are
//!   zeroed when the frame is dropped, so decoded video does not linger in
//!   freed memory.
//! - `Frame::encode_jpeg`: the only serialization path, used to hand a frame
//!   to the vision and perception collaborators.

use anyhow::{anyhow, Context, Result};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

/// JPEG quality used when a frame is sent to an external model.
pub const ANALYSIS_JPEG_QUALITY: u8 = 70;

/// JPEG quality used for single captures handed back to an operator.
pub const CAPTURE_JPEG_QUALITY: u8 = 90;

/// One decoded RGB24 frame. Not `Clone`: every copy of pixel data is explicit.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant (used for read latency and staleness).
    pub captured_at: Instant,
    /// Wall-clock capture time in milliseconds since the epoch.
    pub captured_at_ms: u64,
}

impl Frame {
    /// Wrap RGB24 pixels. Fails if the buffer does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            captured_at_ms: now_ms(),
        })
    }

    /// Solid-color frame, used by synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / 3 {
            data.extend_from_slice(&rgb);
        }
        Self::from_rgb(data, width, height)
    }

    /// Decode a JPEG (or any format the `image` build supports) into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes).context("decode image")?;
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(rgb.into_raw(), width, height)
    }

    /// Read-only pixel access for in-process consumers.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Encode as baseline JPEG at the given quality (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode frame as jpeg")?;
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_rgb(vec![0u8; 10], 4, 4).is_err());
    }

    #[test]
    fn jpeg_encode_decode_keeps_dimensions() -> Result<()> {
        let frame = Frame::filled(64, 48, [200, 10, 10])?;
        let jpeg = frame.encode_jpeg(ANALYSIS_JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = Frame::decode(&jpeg)?;
        assert_eq!(decoded.width, 64);
        assert_eq!(decoded.height, 48);
        // Lossy, but a flat red frame stays red.
        let px = &decoded.pixels()[..3];
        assert!(px[0] > 150 && px[1] < 80 && px[2] < 80);
        Ok(())
    }
}
