//! Analysis backend seam and the HTTP implementation.
//!
//! A backend is anything that can turn a prompt into report text with a
//! confidence score: a model gateway, a records service, a scraper. The
//! orchestrator only sees the trait, so tests swap in scripted backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A source reference attached to backend output.
///
/// `source` is the identity used when merging citations across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Citation {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: None,
            url: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// One prompt as handed to a backend, with its depth-tier token budget.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPrompt {
    pub text: String,
    pub max_tokens: u32,
}

/// Output of a single backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReply {
    pub text: String,
    /// Self-reported confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub citations: Vec<Citation>,
}

/// Failure of a single backend call.
///
/// Payloads are plain strings so outcomes stay cloneable when a result is
/// shared across deduplicated waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("backend service error: {0}")]
    Service(String),
}

/// One analysis provider participating in the fan-out.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Stable provider identifier, used in sections and status surfaces.
    fn id(&self) -> &str;

    /// Run one prompt to completion within `deadline`.
    async fn invoke(&self, prompt: &BackendPrompt, deadline: Duration)
        -> Result<BackendReply, BackendError>;
}

/// Pull a trailing `[confidence: 0.NN]` marker out of backend text.
///
/// Returns the cleaned text and the parsed value when a well-formed marker
/// is present. Malformed markers are left in place.
fn split_confidence_marker(text: &str) -> (String, Option<f32>) {
    if let Some(start) = text.rfind("[confidence:") {
        if let Some(end) = text[start..].find(']') {
            let conf_str = &text[start + 12..start + end];
            if let Ok(conf) = conf_str.trim().parse::<f32>() {
                let mut cleaned = String::with_capacity(text.len());
                cleaned.push_str(&text[..start]);
                cleaned.push_str(&text[start + end + 1..]);
                return (cleaned.trim().to_string(), Some(conf.clamp(0.0, 1.0)));
            }
        }
    }
    (text.to_string(), None)
}

/// Backend that talks to an HTTP analysis service.
pub struct HttpAnalysisBackend {
    id: String,
    endpoint: String,
    model: String,
    http: reqwest::Client,
    temperature: f32,
    /// Used when the service reports no confidence and the text carries no
    /// marker.
    default_confidence: f32,
}

impl HttpAnalysisBackend {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        // Per-call deadlines come from the depth tier; the client only caps
        // how long a connection may take to establish.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            http,
            temperature: 0.3,
            default_confidence: 0.5,
        }
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_default_confidence(mut self, default_confidence: f32) -> Self {
        self.default_confidence = default_confidence.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        prompt: &BackendPrompt,
        deadline: Duration,
    ) -> Result<BackendReply, BackendError> {
        #[derive(Serialize)]
        struct AnalyzeRequest<'a> {
            model: &'a str,
            prompt: &'a str,
            max_tokens: u32,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct AnalyzeResponse {
            text: String,
            confidence: Option<f32>,
            #[serde(default)]
            citations: Vec<Citation>,
        }

        let request = AnalyzeRequest {
            model: &self.model,
            prompt: &prompt.text,
            max_tokens: prompt.max_tokens,
            temperature: self.temperature,
        };

        debug!(
            backend = %self.id,
            model = %self.model,
            max_tokens = prompt.max_tokens,
            "dispatching analysis call"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(deadline)
                } else {
                    BackendError::Service(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(backend = %self.id, status = %status, "analysis service rejected call");
            return Err(BackendError::Service(format!("HTTP {}: {}", status, body)));
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Service(format!("malformed response: {}", e)))?;

        let (text, marker) = split_confidence_marker(&parsed.text);
        let confidence = parsed
            .confidence
            .or(marker)
            .unwrap_or(self.default_confidence)
            .clamp(0.0, 1.0);

        Ok(BackendReply {
            text,
            confidence,
            citations: parsed.citations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_confidence_marker() {
        let (text, conf) =
            split_confidence_marker("Precinct turnout is shifting east. [confidence: 0.85]");
        assert_eq!(text, "Precinct turnout is shifting east.");
        assert_eq!(conf, Some(0.85));
    }

    #[test]
    fn test_missing_marker_keeps_text() {
        let (text, conf) = split_confidence_marker("No marker here.");
        assert_eq!(text, "No marker here.");
        assert_eq!(conf, None);
    }

    #[test]
    fn test_out_of_range_marker_is_clamped() {
        let (_, conf) = split_confidence_marker("Result. [confidence: 3.5]");
        assert_eq!(conf, Some(1.0));
    }

    #[test]
    fn test_malformed_marker_is_ignored() {
        let (text, conf) = split_confidence_marker("Result. [confidence: high]");
        assert_eq!(text, "Result. [confidence: high]");
        assert_eq!(conf, None);
    }

    #[test]
    fn test_last_marker_wins() {
        let (text, conf) =
            split_confidence_marker("Early [confidence: 0.2] read, revised. [confidence: 0.9]");
        assert!(text.contains("[confidence: 0.2]"));
        assert_eq!(conf, Some(0.9));
    }

    #[test]
    fn test_citation_builder() {
        let citation = Citation::new("county-fec-filings")
            .with_title("FEC filings, county rollup")
            .with_url("https://records.example/fec/county");
        assert_eq!(citation.source, "county-fec-filings");
        assert!(citation.url.is_some());

        let json = serde_json::to_string(&Citation::new("bare")).unwrap();
        assert!(!json.contains("title"));
    }
}
