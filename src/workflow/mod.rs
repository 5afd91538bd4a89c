pub mod engine;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod task;

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export common types
pub use engine::WorkflowEngine;
pub use progress::{ProgressSummary, TaskSummary, WorkflowProgress};
pub use registry::WorkflowRegistry;
pub use retry::RetryPolicy;
pub use task::{page_id, PageTask, TaskStatus, DEFAULT_MAX_ATTEMPTS};

/// Workflow-level lifecycle.
///
/// `Pending -> Running -> {Paused <-> Running} -> {Completed, Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
