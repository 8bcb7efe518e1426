use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{VisionClient, VisionReply, DEFAULT_VISION_TIMEOUT};
use crate::pipeline::PipelineKind;

pub const DEFAULT_VISION_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_VISION_MODEL: &str = "gemini-1.5-flash-latest";

const SYSTEM_INSTRUCTION: &str =
    "You are a multi-purpose detection assistant. Analyze the provided image and respond accordingly.";

/// One API key per hazard kind. A kind without a key cannot be analysed.
#[derive(Clone, Debug, Default)]
pub struct VisionKeys {
    pub fire: Option<String>,
    pub helmet: Option<String>,
    pub activity: Option<String>,
}

impl VisionKeys {
    pub fn for_kind(&self, kind: PipelineKind) -> Option<&str> {
        match kind {
            PipelineKind::Fire => self.fire.as_deref(),
            PipelineKind::Helmet => self.helmet.as_deref(),
            PipelineKind::Activity => self.activity.as_deref(),
            PipelineKind::Attendance => None,
        }
    }
}

pub struct HttpVisionClient {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    temperature: f32,
    keys: VisionKeys,
}

impl HttpVisionClient {
    pub fn new(endpoint: &str, model: &str, keys: VisionKeys) -> Self {
        Self::with_timeout(endpoint, model, keys, DEFAULT_VISION_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, model: &str, keys: VisionKeys, timeout: Duration) -> Self {
        for kind in [PipelineKind::Fire, PipelineKind::Helmet, PipelineKind::Activity] {
            if keys.for_kind(kind).is_none() {
                log::warn!("no vision API key for {}; that pipeline will fail", kind.as_str());
            }
        }
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: 0.1,
            keys,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        )
    }

    fn request_body(&self, jpeg: &[u8], instruction: &str) -> Value {
        let image = base64::engine::general_purpose::STANDARD.encode(jpeg);
        json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": instruction },
                    { "inline_data": { "mime_type": "image/jpeg", "data": image } }
                ]
            }],
            "generationConfig": { "temperature": self.temperature }
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

fn reply_text(response: GenerateResponse) -> Result<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("vision response carried no text"));
    }
    Ok(text.to_string())
}

impl VisionClient for HttpVisionClient {
    fn answer(&self, jpeg: &[u8], instruction: &str, kind: PipelineKind) -> Result<VisionReply> {
        let key = self
            .keys
            .for_kind(kind)
            .ok_or_else(|| anyhow!("no vision API key configured for {}", kind.as_str()))?;
        let response: GenerateResponse = self
            .agent
            .post(&self.url())
            .query("key", key)
            .send_json(self.request_body(jpeg, instruction))
            .with_context(|| format!("vision request for {}", kind.as_str()))?
            .into_json()
            .context("decode vision response")?;
        Ok(VisionReply::Text(reply_text(response)?))
    }
}
