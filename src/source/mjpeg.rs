//! HTTP cameras: `multipart/x-mixed-replace` MJPEG streams, or plain JPEG
//! snapshot endpoints polled once per read.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::transport::{FrameReader, Transport};
use super::{CaptureSettings, SourceUri, UriKind};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 4 * 1024 * 1024;

pub struct MjpegTransport {
    timeout: Duration,
}

impl Default for MjpegTransport {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl MjpegTransport {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Transport for MjpegTransport {
    fn name(&self) -> &'static str {
        "http-mjpeg"
    }

    fn supports(&self, uri: &SourceUri) -> bool {
        matches!(uri.kind(), UriKind::Http(_))
    }

    fn open(&self, uri: &SourceUri, _settings: &CaptureSettings) -> Result<Box<dyn FrameReader>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .build();
        let response = agent
            .get(uri.as_str())
            .call()
            .with_context(|| format!("connect to http camera {}", uri))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::Snapshot
        };
        log::info!("MjpegSource: connected to {} ({})", uri, content_type);
        Ok(Box::new(MjpegReader {
            agent,
            url: uri.as_str().to_string(),
            stream,
        }))
    }
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

struct MjpegReader {
    agent: ureq::Agent,
    url: String,
    stream: HttpStream,
}

impl FrameReader for MjpegReader {
    fn read(&mut self) -> Result<Frame> {
        let jpeg = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot => fetch_snapshot(&self.agent, &self.url)?,
        };
        Frame::decode(&jpeg)
    }

    fn close(&mut self) {
        self.stream = HttpStream::Snapshot;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // Keep the last byte in case it is the first half of a marker.
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 1;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Start (SOI) and one-past-end (after EOI) of the first complete JPEG.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_complete_jpeg_between_multipart_headers() {
        let mut buf = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        buf.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        buf.extend_from_slice(b"\r\n--frame");
        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!(&buf[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_is_not_returned() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2]).is_none());
        assert!(find_jpeg_bounds(&[1, 2, 3]).is_none());
    }

    #[test]
    fn stream_yields_consecutive_frames() -> Result<()> {
        let frame = Frame::filled(8, 8, [0, 120, 0])?;
        let jpeg = frame.encode_jpeg(80)?;
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        assert_eq!(stream.read_next_jpeg()?, jpeg);
        assert_eq!(stream.read_next_jpeg()?, jpeg);
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn only_http_uris_are_supported() -> Result<()> {
        let transport = MjpegTransport::default();
        assert!(transport.supports(&SourceUri::parse("https://cam/stream.mjpg")?));
        assert!(!transport.supports(&SourceUri::parse("rtsp://cam/stream")?));
        Ok(())
    }
}
