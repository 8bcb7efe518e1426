//! Perception sidecar client.
//!
//! The sidecar exposes two endpoints that take a JPEG body:
//! - `POST {base}/faces` -> `{"faces": [{"embedding": [..], "bbox": {..}}]}`
//! - `POST {base}/hands` -> `{"hands": [{"landmarks": [{"x": .., "y": ..}]}]}`

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::frame::{Frame, ANALYSIS_JPEG_QUALITY};
use crate::perception::backend::PerceptionBackend;
use crate::perception::result::{FaceObservation, HandLandmarks};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct FacesResponse {
    #[serde(default)]
    faces: Vec<FaceObservation>,
}

#[derive(Deserialize)]
struct HandsResponse {
    #[serde(default)]
    hands: Vec<HandLandmarks>,
}

pub struct HttpPerceptionBackend {
    agent: ureq::Agent,
    faces_url: Url,
    hands_url: Url,
}

impl HttpPerceptionBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("invalid perception url '{}'", base_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!("perception url must be http(s): {}", base_url));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let faces_url = base.join("faces").context("build faces endpoint")?;
        let hands_url = base.join("hands").context("build hands endpoint")?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            faces_url,
            hands_url,
        })
    }

    pub fn faces_url(&self) -> &Url {
        &self.faces_url
    }

    fn post_jpeg(&self, url: &Url, frame: &Frame) -> Result<ureq::Response> {
        let jpeg = frame.encode_jpeg(ANALYSIS_JPEG_QUALITY)?;
        self.agent
            .post(url.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("POST {}", url))
    }
}

impl PerceptionBackend for HttpPerceptionBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn faces(&self, frame: &Frame) -> Result<Vec<FaceObservation>> {
        let response: FacesResponse = self
            .post_jpeg(&self.faces_url, frame)?
            .into_json()
            .context("decode faces response")?;
        Ok(response.faces)
    }

    fn hands(&self, frame: &Frame) -> Result<Vec<HandLandmarks>> {
        let response: HandsResponse = self
            .post_jpeg(&self.hands_url, frame)?
            .into_json()
            .context("decode hands response")?;
        Ok(response.hands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoints_under_base_path() -> Result<()> {
        let backend = HttpPerceptionBackend::new("http://127.0.0.1:9100/v1")?;
        assert_eq!(backend.faces_url().as_str(), "http://127.0.0.1:9100/v1/faces");
        assert_eq!(backend.hands_url.as_str(), "http://127.0.0.1:9100/v1/hands");
        Ok(())
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpPerceptionBackend::new("rtsp://cam/stream").is_err());
        assert!(HttpPerceptionBackend::new("not a url").is_err());
    }

    #[test]
    fn parses_sidecar_payloads() -> Result<()> {
        let faces: FacesResponse = serde_json::from_str(
            r#"{"faces":[{"embedding":[0.1,0.2],"bbox":{"x":0.1,"y":0.1,"w":0.2,"h":0.3}}]}"#,
        )?;
        assert_eq!(faces.faces[0].embedding, vec![0.1, 0.2]);

        let hands: HandsResponse =
            serde_json::from_str(r#"{"hands":[{"landmarks":[{"x":0.5,"y":0.4}]}]}"#)?;
        assert_eq!(hands.hands[0].len(), 1);
        assert_eq!(hands.hands[0].point(0).map(|p| p.y), Some(0.4));
        Ok(())
    }
}
