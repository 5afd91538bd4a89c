use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::task::{PageTask, TaskStatus};
use crate::workflow::WorkflowStatus;

/// Aggregate counters and timing for a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProgress {
    pub total_pages: usize,
    pub completed_pages: usize,
    /// Tasks that failed with no attempts left
    pub failed_pages: usize,
    pub skipped_pages: usize,
    pub current_index: Option<usize>,
    pub current_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub avg_processing_time_seconds: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl WorkflowProgress {
    pub fn new(total_pages: usize) -> Self {
        Self {
            total_pages,
            ..Default::default()
        }
    }

    /// Pages that still need work, never negative
    pub fn pending_pages(&self) -> usize {
        self.total_pages
            .saturating_sub(self.completed_pages + self.failed_pages + self.skipped_pages)
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        let done = self.completed_pages + self.failed_pages + self.skipped_pages;
        done as f64 / self.total_pages as f64 * 100.0
    }

    /// Recompute counters and estimates from the task list
    pub fn refresh(&mut self, tasks: &[PageTask]) {
        self.total_pages = tasks.len();
        self.completed_pages = 0;
        self.failed_pages = 0;
        self.skipped_pages = 0;

        let mut finished_secs = 0.0;
        let mut finished = 0usize;

        for task in tasks {
            match task.status {
                TaskStatus::Completed => self.completed_pages += 1,
                TaskStatus::Skipped => self.skipped_pages += 1,
                TaskStatus::Failed if task.is_terminal() => self.failed_pages += 1,
                _ => {}
            }

            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) && task.is_terminal() {
                if let Some(secs) = task.processing_seconds() {
                    finished_secs += secs;
                    finished += 1;
                }
            }
        }

        if finished > 0 {
            self.avg_processing_time_seconds = finished_secs / finished as f64;
        }

        let pending = self.pending_pages();
        self.estimated_completion = if pending == 0 {
            self.end_time
        } else if finished > 0 {
            let remaining_ms = (self.avg_processing_time_seconds * pending as f64 * 1000.0) as i64;
            Some(Utc::now() + ChronoDuration::milliseconds(remaining_ms))
        } else {
            None
        };
    }
}

/// Per-task line of a progress summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub url: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
}

impl From<&PageTask> for TaskSummary {
    fn from(task: &PageTask) -> Self {
        Self {
            id: task.id.clone(),
            url: task.url.clone(),
            status: task.status,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            error_message: task.error_message.clone(),
        }
    }
}

/// Point-in-time view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub progress: WorkflowProgress,
    pub pending_pages: usize,
    pub completion_percentage: f64,
    pub tasks: Vec<TaskSummary>,
}

impl ProgressSummary {
    pub fn new(workflow_id: &str, status: WorkflowStatus, progress: &WorkflowProgress, tasks: &[PageTask]) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            status,
            progress: progress.clone(),
            pending_pages: progress.pending_pages(),
            completion_percentage: progress.completion_percentage(),
            tasks: tasks.iter().map(TaskSummary::from).collect(),
        }
    }

    /// Status of the task with the given id
    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.status)
    }

    /// Count tasks in a given status
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}
