//! Minimal Gemini `generateContent` client.
//!
//! Shared by the signature classifier and the image extractor. Requests are
//! single-shot: no retry or backoff happens here, the caller decides whether
//! to try again. Every request carries the configured timeout and an expired
//! timeout surfaces as [`GeminiError::Timeout`].

use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("{0} environment variable not set")]
    MissingApiKey(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gemini API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Gemini response contained no text")]
    EmptyResponse,
}

/// One part of a multimodal request.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl Part {
    fn to_json(&self) -> Value {
        match self {
            Part::Text(text) => json!({ "text": text }),
            Part::InlineData { mime_type, data } => json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                }
            }),
        }
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    timeout_secs: u64,
}

impl GeminiClient {
    /// Builds a client, reading the API key from `api_key_env`.
    pub fn from_env(
        endpoint: &str,
        model: &str,
        api_key_env: &str,
        timeout_secs: u64,
    ) -> Result<Self, GeminiError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| GeminiError::MissingApiKey(api_key_env.to_string()))?;
        Self::new(endpoint, model, api_key, timeout_secs)
    }

    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, GeminiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            timeout_secs,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one request and returns the concatenated text of the first candidate.
    pub async fn generate(&self, parts: &[Part]) -> Result<String, GeminiError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        debug!("POST {} ({} parts)", url, parts.len());
        let body = json!({
            "contents": [{
                "parts": parts.iter().map(Part::to_json).collect::<Vec<_>>(),
            }]
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeminiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = response.json().await.map_err(|e| self.map_transport(e))?;
        response_text(&json).ok_or(GeminiError::EmptyResponse)
    }

    fn map_transport(&self, e: reqwest::Error) -> GeminiError {
        if e.is_timeout() {
            GeminiError::Timeout(self.timeout_secs)
        } else {
            GeminiError::Http(e)
        }
    }
}

/// Joins `candidates[0].content.parts[*].text`.
fn response_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_text_joins_parts() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"column\": " }, { "text": "\"A\", \"value\": \"1\"}" }] }
            }]
        });
        assert_eq!(
            response_text(&json).unwrap(),
            "{\"column\": \"A\", \"value\": \"1\"}"
        );
    }

    #[test]
    fn test_response_text_missing_candidates() {
        assert!(response_text(&json!({ "promptFeedback": {} })).is_none());
        assert!(response_text(&json!({ "candidates": [] })).is_none());
    }

    #[test]
    fn test_inline_data_is_base64() {
        let part = Part::InlineData {
            mime_type: "image/png".into(),
            data: b"abc".to_vec(),
        };
        assert_eq!(part.to_json()["inline_data"]["data"], "YWJj");
    }

    #[test]
    fn test_missing_api_key() {
        let err = GeminiClient::from_env("http://localhost", "m", "TMERGE_TEST_UNSET_KEY", 5)
            .err()
            .unwrap();
        assert!(matches!(err, GeminiError::MissingApiKey(_)));
    }
}
