use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;
use url::Url;

/// Default number of attempts a page gets before it is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const MAX_SLUG_LEN: usize = 60;
const HASH_LEN: usize = 8;

/// Processing state of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// One URL's processing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTask {
    /// Stable identifier derived from the URL
    pub id: String,

    /// URL to analyze
    pub url: String,

    pub status: TaskStatus,

    /// Number of failed attempts so far
    pub attempts: u32,

    pub max_attempts: u32,

    pub started_at: Option<DateTime<Utc>>,

    pub ended_at: Option<DateTime<Utc>>,

    /// Last failure reason
    pub error_message: Option<String>,

    /// Path of the persisted analysis, relative to the project root
    pub result_ref: Option<String>,
}

impl PageTask {
    /// Create a pending task for `url`
    pub fn new(url: impl Into<String>, max_attempts: u32) -> Self {
        let url = url.into();
        Self {
            id: page_id(&url),
            url,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            started_at: None,
            ended_at: None,
            error_message: None,
            result_ref: None,
        }
    }

    /// Whether the task has reached a state the engine never leaves on its own
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Skipped => true,
            TaskStatus::Failed => !self.can_retry(),
            TaskStatus::Pending | TaskStatus::InProgress => false,
        }
    }

    /// A failed task may run again only while it has attempts left
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts < self.max_attempts
    }

    /// Whether the engine should pick this task up
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, TaskStatus::Pending) || self.can_retry()
    }

    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self, result_ref: String) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.error_message = None;
        self.result_ref = Some(result_ref);
    }

    /// Record one failed attempt. Returns `true` when attempts are exhausted.
    pub fn record_failure(&mut self, message: impl Into<String>) -> bool {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());

        let exhausted = self.attempts >= self.max_attempts;
        if exhausted {
            self.ended_at = Some(Utc::now());
        }
        exhausted
    }

    pub fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
        self.ended_at = Some(Utc::now());
    }

    /// Processing time in seconds for finished tasks
    pub fn processing_seconds(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Derive a deterministic task id: a readable slug of the URL plus a short
/// hash of the full URL, so the same URL maps to the same id on every run.
pub fn page_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hash = &hex::encode(digest)[..HASH_LEN];
    format!("{}-{}", slug(url), hash)
}

fn slug(url: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let non_alnum = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

    let readable = match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            let host = host.strip_prefix("www.").unwrap_or(host);
            format!("{}{}", host, parsed.path())
        }
        Err(_) => url.to_string(),
    };

    let lowered = readable.to_lowercase();
    let slug = non_alnum.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');

    let mut truncated: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }

    if truncated.is_empty() {
        "page".to_string()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_is_deterministic() {
        let url = "https://www.Example.com/Products/list.asp?cat=3";
        assert_eq!(page_id(url), page_id(url));
        assert!(page_id(url).starts_with("example-com-products-list-asp-"));
    }

    #[test]
    fn test_page_id_distinguishes_query_strings() {
        let a = page_id("https://example.com/list.asp?page=1");
        let b = page_id("https://example.com/list.asp?page=2");
        assert_ne!(a, b);
        // Same slug, different hash suffix
        assert_eq!(a.rsplit_once('-').unwrap().0, b.rsplit_once('-').unwrap().0);
    }

    #[test]
    fn test_page_id_fallbacks() {
        assert!(page_id("https://example.com/").starts_with("example-com-"));
        assert!(page_id("???").starts_with("page-"));

        let long = format!("https://example.com/{}", "segment/".repeat(30));
        let id = page_id(&long);
        let (slug, hash) = id.rsplit_once('-').unwrap();
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert_eq!(hash.len(), HASH_LEN);
    }

    #[test]
    fn test_retry_bookkeeping() {
        let mut task = PageTask::new("https://example.com/a", 2);
        assert!(task.is_runnable());

        task.mark_in_progress();
        assert!(!task.record_failure("timeout"));
        assert!(task.can_retry());
        assert!(!task.is_terminal());

        assert!(task.record_failure("timeout again"));
        assert_eq!(task.attempts, 2);
        assert!(!task.can_retry());
        assert!(task.is_terminal());
        assert!(task.ended_at.is_some());

        // Attempts never exceed the maximum
        task.record_failure("extra");
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn test_completion_clears_error() {
        let mut task = PageTask::new("https://example.com/a", 3);
        task.mark_in_progress();
        task.record_failure("flaky");
        task.mark_in_progress();
        task.mark_completed("analysis/pages/x.json".to_string());

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_message.is_none());
        assert!(task.is_terminal());
        assert!(task.processing_seconds().is_some());
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let task = PageTask::new("https://example.com/", 0);
        assert_eq!(task.max_attempts, 1);
    }
}
