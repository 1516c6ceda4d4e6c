use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use super::Classifier;
use crate::observation::Verdict;
use crate::source::Frame;

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    is_ad: bool,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Posts the frame as PNG to an inference service and reads
/// `{"is_ad": bool, "confidence": float?}` back.
pub struct HttpClassifier {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpClassifier {
    /// `timeout` bounds the HTTP exchange itself; the sampler applies its own deadline too.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build classifier client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, frame: &Frame) -> Result<Verdict> {
        let body = frame.encode_png()?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .with_context(|| format!("classifier request to {} failed", self.endpoint))?;
        if !response.status().is_success() {
            bail!("classifier {} returned {}", self.endpoint, response.status());
        }
        let parsed: ClassifyResponse = response
            .json()
            .context("classifier returned malformed JSON")?;
        Ok(Verdict {
            is_ad: parsed.is_ad,
            confidence: parsed.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_optional() {
        let parsed: ClassifyResponse = serde_json::from_str(r#"{"is_ad": true}"#).unwrap();
        assert!(parsed.is_ad);
        assert_eq!(parsed.confidence, None);

        let parsed: ClassifyResponse =
            serde_json::from_str(r#"{"is_ad": false, "confidence": 0.25}"#).unwrap();
        assert_eq!(parsed.confidence, Some(0.25));
    }

    #[test]
    fn unreachable_endpoint_is_an_error() {
        let classifier =
            HttpClassifier::new("http://127.0.0.1:9/classify", Duration::from_millis(500)).unwrap();
        let frame = Frame {
            rgba: vec![0; 16],
            width: 2,
            height: 2,
        };
        assert!(classifier.classify(&frame).is_err());
        assert_eq!(classifier.endpoint(), "http://127.0.0.1:9/classify");
    }
}
