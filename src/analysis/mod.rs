//! Transcript analysis
//!
//! Summaries and talking-point suggestions for a call transcript. Analysis
//! never fails from the caller's view: a failed summary is reported as
//! absent and failed or empty suggestions fall back to a fixed list.

pub mod gemini;

pub use gemini::GeminiAnalyzer;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Suggestions used when the analyzer cannot provide any
pub const DEFAULT_SUGGESTIONS: [&str; 3] = [
    "Discuss project timeline",
    "Review recent changes",
    "Set next meeting",
];

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Analyzer is disabled")]
    Disabled,
    #[error("Analyzer request failed: {0}")]
    Request(String),
    #[error("Analyzer returned status {0}")]
    Status(u16),
    #[error("Unexpected analyzer response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSummary {
    pub summary: String,
    pub action_items: Vec<String>,
}

/// Combined result of one analysis request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnalysisReport {
    pub summary: Option<MeetingSummary>,
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait TranscriptAnalyzer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<MeetingSummary, AnalyzerError>;

    async fn suggest(&self, context: &str) -> Result<Vec<String>, AnalyzerError>;
}

/// Analyzer used when none is configured; every call fails
pub struct DisabledAnalyzer;

#[async_trait]
impl TranscriptAnalyzer for DisabledAnalyzer {
    async fn summarize(&self, _transcript: &str) -> Result<MeetingSummary, AnalyzerError> {
        Err(AnalyzerError::Disabled)
    }

    async fn suggest(&self, _context: &str) -> Result<Vec<String>, AnalyzerError> {
        Err(AnalyzerError::Disabled)
    }
}

/// Runs summary and suggestions concurrently and applies the fallbacks
#[derive(Clone)]
pub struct AnalysisService {
    analyzer: Arc<dyn TranscriptAnalyzer>,
}

impl AnalysisService {
    pub fn new(analyzer: Arc<dyn TranscriptAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledAnalyzer))
    }

    pub async fn analyze(&self, transcript: &str) -> AnalysisReport {
        let (summary, suggestions) = tokio::join!(
            self.analyzer.summarize(transcript),
            self.analyzer.suggest(transcript)
        );

        let summary = match summary {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Meeting summary unavailable: {}", e);
                None
            }
        };

        let suggestions = match suggestions {
            Ok(suggestions) if !suggestions.is_empty() => suggestions,
            Ok(_) => default_suggestions(),
            Err(e) => {
                warn!("Using default suggestions: {}", e);
                default_suggestions()
            }
        };

        AnalysisReport { summary, suggestions }
    }
}

pub fn default_suggestions() -> Vec<String> {
    DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        summary: Option<MeetingSummary>,
        suggestions: Result<Vec<String>, ()>,
    }

    #[async_trait]
    impl TranscriptAnalyzer for Fixed {
        async fn summarize(&self, _transcript: &str) -> Result<MeetingSummary, AnalyzerError> {
            self.summary
                .clone()
                .ok_or_else(|| AnalyzerError::Response("no summary".to_string()))
        }

        async fn suggest(&self, _context: &str) -> Result<Vec<String>, AnalyzerError> {
            self.suggestions
                .clone()
                .map_err(|_| AnalyzerError::Status(503))
        }
    }

    fn summary() -> MeetingSummary {
        MeetingSummary {
            summary: "Agreed on the release".to_string(),
            action_items: vec!["Tag v1".to_string()],
        }
    }

    #[tokio::test]
    async fn analyzer_results_pass_through() {
        let service = AnalysisService::new(Arc::new(Fixed {
            summary: Some(summary()),
            suggestions: Ok(vec!["Ask about QA".to_string()]),
        }));
        let report = service.analyze("we shipped").await;
        assert_eq!(report.summary, Some(summary()));
        assert_eq!(report.suggestions, vec!["Ask about QA".to_string()]);
    }

    #[tokio::test]
    async fn failures_fall_back() {
        let service = AnalysisService::new(Arc::new(Fixed {
            summary: None,
            suggestions: Err(()),
        }));
        let report = service.analyze("anything").await;
        assert_eq!(report.summary, None);
        assert_eq!(report.suggestions, default_suggestions());
    }

    #[tokio::test]
    async fn empty_suggestions_fall_back() {
        let service = AnalysisService::new(Arc::new(Fixed {
            summary: Some(summary()),
            suggestions: Ok(Vec::new()),
        }));
        assert_eq!(service.analyze("x").await.suggestions.len(), 3);
    }

    #[tokio::test]
    async fn disabled_analyzer_uses_defaults() {
        let report = AnalysisService::disabled().analyze("x").await;
        assert!(report.summary.is_none());
        assert_eq!(report.suggestions[0], "Discuss project timeline");
    }
}
