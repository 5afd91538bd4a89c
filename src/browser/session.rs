use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Browser engine driven through WebDriver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chrome,
    Firefox,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Chrome => write!(f, "chrome"),
            EngineKind::Firefox => write!(f, "firefox"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" | "chromium" => Ok(EngineKind::Chrome),
            "firefox" => Ok(EngineKind::Firefox),
            other => Err(format!("unsupported browser engine: {}", other)),
        }
    }
}

/// Lifecycle state of a browser session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Crashed,
    Closed,
}

/// Metadata and running metrics for one browser context/page pair.
///
/// The pool owns every session; callers only ever see clones of this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSession {
    /// Unique identifier, regenerated whenever the pool recreates the session
    pub id: String,

    /// Browser engine backing this session
    pub engine_kind: EngineKind,

    /// Current lifecycle state
    pub status: SessionStatus,

    /// When the session was opened
    pub created_at: DateTime<Utc>,

    /// Number of successful navigations
    pub pages_loaded: u64,

    /// Accumulated navigation time
    pub total_load_time: Duration,

    /// Number of times this session's context was found dead
    pub crash_count: u32,
}

impl BrowserSession {
    pub fn new(engine_kind: EngineKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            engine_kind,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            pages_loaded: 0,
            total_load_time: Duration::ZERO,
            crash_count: 0,
        }
    }

    /// Record a successful navigation
    pub fn record_load(&mut self, elapsed: Duration) {
        self.pages_loaded += 1;
        self.total_load_time += elapsed;
    }

    /// Record that the underlying context died
    pub fn mark_crashed(&mut self) {
        self.status = SessionStatus::Crashed;
        self.crash_count += 1;
    }

    /// Average navigation time, if any page has been loaded
    pub fn avg_load_time(&self) -> Option<Duration> {
        if self.pages_loaded == 0 {
            None
        } else {
            Some(self.total_load_time / self.pages_loaded as u32)
        }
    }
}
