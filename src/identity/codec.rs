use anyhow::{anyhow, Context, Result};
use base64::Engine;

/// Decode a stored template.
///
/// Two forms are accepted: a JSON array of numbers, or base64 of
/// little-endian `f64` values. Missing base64 padding is repaired.
pub fn decode_template(serialized: &str) -> Result<Vec<f32>> {
    let trimmed = serialized.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty template"));
    }
    if trimmed.starts_with('[') {
        let values: Vec<f64> = serde_json::from_str(trimmed).context("parse JSON template")?;
        return finite(values);
    }

    let bytes = decode_base64_lenient(trimmed)?;
    if bytes.is_empty() || bytes.len() % 8 != 0 {
        return Err(anyhow!(
            "template payload is {} bytes, not a whole number of f64 values",
            bytes.len()
        ));
    }
    let values = bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect();
    finite(values)
}

/// Encode an embedding in the base64 form `decode_template` reads.
pub fn encode_template(embedding: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(embedding.len() * 8);
    for v in embedding {
        bytes.extend_from_slice(&(*v as f64).to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_base64_lenient(encoded: &str) -> Result<Vec<u8>> {
    let engine = &base64::engine::general_purpose::STANDARD;
    if let Ok(bytes) = engine.decode(encoded) {
        return Ok(bytes);
    }
    let mut padded = encoded.to_string();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }
    engine.decode(&padded).context("decode base64 template")
}

fn finite(values: Vec<f64>) -> Result<Vec<f32>> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("template contains non-finite values"));
    }
    Ok(values.into_iter().map(|v| v as f32).collect())
}
