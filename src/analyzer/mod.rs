pub mod html;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::browser::PageHandle;

// Re-export common types
pub use html::HtmlPageAnalyzer;

/// Output of one page analysis. The payload format belongs to the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// URL that was requested
    pub url: String,

    /// URL after redirects, if the analyzer captured it
    pub final_url: Option<String>,

    pub title: Option<String>,

    /// Analyzer-specific structured data
    pub data: serde_json::Value,

    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            final_url: None,
            title: None,
            data,
            analyzed_at: Utc::now(),
        }
    }
}

/// Extracts data from a loaded page.
///
/// Any error is treated by the workflow as a failed attempt for that page.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        page: &PageHandle,
        url: &str,
        output_root: &Path,
    ) -> anyhow::Result<AnalysisResult>;
}
