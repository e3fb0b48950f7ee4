#![cfg(feature = "classifier-http")]

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::compliance::backend::PpeBackend;
use crate::frame::Frame;
use crate::track::Track;

const JPEG_QUALITY: u8 = 85;

/// Remote PPE classifier: POSTs the person crop as JPEG, reads back a JSON
/// object of attribute booleans (`{"hard_hat": true, "vest": false}`).
pub struct HttpPpeBackend {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpPpeBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(anyhow!("classifier endpoint must be an http(s) url: {}", endpoint));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint: endpoint.to_string(),
        })
    }
}

impl PpeBackend for HttpPpeBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn classify(&mut self, frame: &Frame, track: &Track) -> Result<BTreeMap<String, bool>> {
        let jpeg = encode_crop(frame, track)?;
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "image/jpeg")
            .set("X-Track-Id", &track.object_id().to_string())
            .set("X-Frame-Index", &frame.index.to_string())
            .send_bytes(&jpeg)
            .with_context(|| format!("classifier request to {}", self.endpoint))?;
        let body = response.into_string().context("read classifier response")?;
        parse_answer(&body)
    }
}

fn encode_crop(frame: &Frame, track: &Track) -> Result<Vec<u8>> {
    let b = track.bbox().clamped(frame.width(), frame.height());
    let x = b.x1.floor().max(0.0) as u32;
    let y = b.y1.floor().max(0.0) as u32;
    let w = (b.width().ceil() as u32).max(1).min(frame.width().saturating_sub(x));
    let h = (b.height().ceil() as u32).max(1).min(frame.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(anyhow!("track {} has an empty crop", track.object_id()));
    }
    let crop = image::imageops::crop_imm(frame.image(), x, y, w, h).to_image();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(crop.as_raw(), w, h, ExtendedColorType::Rgb8)
        .context("encode person crop")?;
    Ok(out)
}

fn parse_answer(body: &str) -> Result<BTreeMap<String, bool>> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("classifier response is not JSON")?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("classifier response must be a JSON object"))?;
    Ok(object
        .iter()
        .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_attributes_only() {
        let answer = parse_answer(r#"{"hard_hat": true, "vest": false, "note": "blurry"}"#).unwrap();
        assert_eq!(answer.len(), 2);
        assert_eq!(answer["hard_hat"], true);
        assert_eq!(answer["vest"], false);
        assert!(parse_answer("[true]").is_err());
    }

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(HttpPpeBackend::new("ftp://x", Duration::from_secs(1)).is_err());
    }
}
