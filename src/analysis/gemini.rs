//! Gemini `generateContent` analyzer

use super::{AnalyzerError, MeetingSummary, TranscriptAnalyzer};
use crate::config::AnalyzerConfig;
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub struct GeminiAnalyzer {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiAnalyzer {
    pub fn new(config: &AnalyzerConfig, api_key: String) -> Result<Self, AnalyzerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(to_request_error)?;
        Ok(Self {
            http,
            url: format!(
                "{}/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key,
        })
    }

    /// Build from configuration, reading the key from the configured
    /// environment variable. `None` when disabled or the key is missing.
    pub fn from_env(config: &AnalyzerConfig) -> Option<Result<Self, AnalyzerError>> {
        if !config.enabled {
            return None;
        }
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty())?;
        Some(Self::new(config, api_key))
    }

    async fn generate<T: DeserializeOwned>(&self, prompt: String, schema: Value) -> Result<T, AnalyzerError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            },
        });

        let response = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(to_request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AnalyzerError::Status(status.as_u16()));
        }

        let response: GenerateResponse = response.json().await.map_err(to_request_error)?;
        let text = response.text()?;
        debug!("Analyzer returned {} bytes", text.len());
        serde_json::from_str(text).map_err(|e| AnalyzerError::Response(e.to_string()))
    }
}

#[async_trait]
impl TranscriptAnalyzer for GeminiAnalyzer {
    async fn summarize(&self, transcript: &str) -> Result<MeetingSummary, AnalyzerError> {
        let prompt = format!(
            "Summarize this video call transcript briefly and list 3 action items: {}",
            transcript
        );
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "summary": { "type": "STRING" },
                "actionItems": { "type": "ARRAY", "items": { "type": "STRING" } },
            },
            "required": ["summary", "actionItems"],
        });
        self.generate(prompt, schema).await
    }

    async fn suggest(&self, context: &str) -> Result<Vec<String>, AnalyzerError> {
        let prompt = format!(
            "Given this meeting context: \"{}\", propose 3 useful talking points or questions.",
            context
        );
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "suggestions": { "type": "ARRAY", "items": { "type": "STRING" } },
            },
        });
        let parsed: Suggestions = self.generate(prompt, schema).await?;
        Ok(parsed.suggestions)
    }
}

#[derive(Debug, Deserialize)]
struct Suggestions {
    #[serde(default)]
    suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> Result<&str, AnalyzerError> {
        self.candidates
            .first()
            .and_then(|c| c.content.parts.iter().find_map(|p| p.text.as_deref()))
            .ok_or_else(|| AnalyzerError::Response("no text candidate".to_string()))
    }
}

fn to_request_error(err: reqwest::Error) -> AnalyzerError {
    AnalyzerError::Request(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    fn config(endpoint: String) -> AnalyzerConfig {
        AnalyzerConfig {
            endpoint,
            ..AnalyzerConfig::default()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{}", addr)
    }

    fn wrap(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    #[test]
    fn test_response_text_extraction() {
        let response: GenerateResponse = serde_json::from_value(wrap("{\"suggestions\":[]}")).unwrap();
        assert_eq!(response.text().unwrap(), "{\"suggestions\":[]}");

        let empty: GenerateResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(matches!(empty.text(), Err(AnalyzerError::Response(_))));
    }

    #[tokio::test]
    async fn test_summarize_against_local_endpoint() {
        let router = Router::new().fallback(
            |uri: Uri, headers: HeaderMap, Json(body): Json<Value>| async move {
                assert!(uri.path().ends_with(":generateContent"));
                assert_eq!(headers.get("x-goog-api-key").unwrap(), "secret");
                assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
                Json(wrap(r#"{"summary":"Short call","actionItems":["Follow up"]}"#))
            },
        );
        let endpoint = serve(router).await;

        let analyzer = GeminiAnalyzer::new(&config(endpoint), "secret".to_string()).unwrap();
        let summary = analyzer.summarize("hello").await.unwrap();
        assert_eq!(summary.summary, "Short call");
        assert_eq!(summary.action_items, vec!["Follow up".to_string()]);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let router = Router::new().fallback(|| async { StatusCode::TOO_MANY_REQUESTS });
        let endpoint = serve(router).await;

        let analyzer = GeminiAnalyzer::new(&config(endpoint), "secret".to_string()).unwrap();
        assert!(matches!(analyzer.suggest("ctx").await, Err(AnalyzerError::Status(429))));
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let config = AnalyzerConfig {
            enabled: false,
            ..AnalyzerConfig::default()
        };
        assert!(GeminiAnalyzer::from_env(&config).is_none());
    }
}
