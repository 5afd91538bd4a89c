use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

use crate::analyzer::PageAnalyzer;
use crate::browser::BrowserSessionPool;
use crate::cli::config::AppConfig;
use crate::error::CheckpointError;
use crate::storage::write_atomic;
use crate::workflow::{PageTask, WorkflowEngine, WorkflowProgress, WorkflowStatus};

/// Version written into every checkpoint
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const CHECKPOINTS_DIR: &str = "workflow/checkpoints";

/// Serializable snapshot of a whole workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCheckpoint {
    pub schema_version: u32,
    pub project_id: String,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    pub tasks: Vec<PageTask>,
    pub progress: WorkflowProgress,
    pub config_snapshot: AppConfig,
}

impl WorkflowCheckpoint {
    /// Structural checks serde cannot express
    fn validate(&self) -> Result<(), String> {
        if self.workflow_id.trim().is_empty() {
            return Err("empty workflowId".to_string());
        }
        if self.tasks.len() != self.progress.total_pages {
            return Err(format!(
                "progress.totalPages is {} but {} task(s) are recorded",
                self.progress.total_pages,
                self.tasks.len()
            ));
        }
        for task in &self.tasks {
            if task.id.is_empty() || task.url.is_empty() {
                return Err("task with empty id or url".to_string());
            }
            if task.attempts > task.max_attempts {
                return Err(format!(
                    "task {} has {} attempts but maxAttempts is {}",
                    task.id, task.attempts, task.max_attempts
                ));
            }
        }
        Ok(())
    }
}

/// Reads and writes checkpoints under `<project>/workflow/checkpoints/`
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    project_root: PathBuf,
}

impl CheckpointStore {
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.project_root.join(CHECKPOINTS_DIR)
    }

    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{}.json", workflow_id))
    }

    /// Atomically write `checkpoint`, returning the file it was written to
    pub async fn save(&self, checkpoint: &WorkflowCheckpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(&checkpoint.workflow_id);
        let contents = serde_json::to_vec_pretty(checkpoint)?;

        write_atomic(&path, &contents).await?;
        debug!(
            "Checkpoint written: {} ({}/{} pages done)",
            path.display(),
            checkpoint.progress.total_pages - checkpoint.progress.pending_pages(),
            checkpoint.progress.total_pages
        );

        Ok(path)
    }

    /// Load the checkpoint of a workflow in this project
    pub async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowCheckpoint, CheckpointError> {
        Self::load(&self.path_for(workflow_id)).await
    }

    /// Load and validate a checkpoint file. Never returns a partial checkpoint.
    pub async fn load(path: &Path) -> Result<WorkflowCheckpoint, CheckpointError> {
        let contents = fs::read(path).await?;
        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&contents).map_err(|e| corrupt(format!("invalid JSON: {}", e)))?;

        let version = value
            .get("schemaVersion")
            .ok_or_else(|| corrupt("missing schemaVersion".to_string()))?
            .as_u64()
            .ok_or_else(|| corrupt("schemaVersion is not an integer".to_string()))?;
        if version != u64::from(CHECKPOINT_SCHEMA_VERSION) {
            return Err(CheckpointError::UnsupportedVersion {
                found: version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        let checkpoint: WorkflowCheckpoint =
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        checkpoint.validate().map_err(corrupt)?;

        Ok(checkpoint)
    }

    /// Rebuild a workflow engine from `checkpoint`.
    ///
    /// Tasks interrupted mid-flight restart as pending; failed tasks with
    /// attempts left stay eligible for retry.
    pub fn resume_from(
        &self,
        checkpoint: WorkflowCheckpoint,
        pool: Arc<BrowserSessionPool>,
        analyzer: Arc<dyn PageAnalyzer>,
    ) -> WorkflowEngine {
        info!(
            "Resuming workflow {} from checkpoint taken at {}",
            checkpoint.workflow_id, checkpoint.created_at
        );
        WorkflowEngine::restore(checkpoint, self.project_root.clone(), pool, analyzer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::MockPageAnalyzer;
    use crate::browser::testing::FakeDriver;
    use crate::workflow::TaskStatus;

    fn sample_checkpoint() -> WorkflowCheckpoint {
        let mut tasks: Vec<PageTask> = (0..4)
            .map(|i| PageTask::new(format!("https://legacy.example.com/page{}.asp", i), 2))
            .collect();
        tasks[0].mark_in_progress();
        tasks[0].mark_completed("analysis/pages/a.json".to_string());
        tasks[1].mark_in_progress();
        tasks[2].mark_in_progress();
        tasks[2].record_failure("timeout");

        let mut progress = WorkflowProgress::new(tasks.len());
        progress.start_time = Some(Utc::now());
        progress.refresh(&tasks);

        WorkflowCheckpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            project_id: "acme".to_string(),
            workflow_id: "wf-1".to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Paused,
            tasks,
            progress,
            config_snapshot: AppConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_project(dir.path());
        let checkpoint = sample_checkpoint();

        let path = store.save(&checkpoint).await.unwrap();
        assert_eq!(path, dir.path().join("workflow/checkpoints/wf-1.json"));

        let loaded = CheckpointStore::load(&path).await.unwrap();
        assert_eq!(loaded, checkpoint);

        // Saving again without mutation yields an equivalent checkpoint
        store.save(&loaded).await.unwrap();
        let reloaded = store.load_workflow("wf-1").await.unwrap();
        assert_eq!(reloaded, checkpoint);

        let files = std::fs::read_dir(store.checkpoints_dir()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_missing_field_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_project(dir.path());
        let path = store.save(&sample_checkpoint()).await.unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("tasks");
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let err = CheckpointStore::load(&path).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{\"schemaVersion\": 1, \"tasks\": [").unwrap();

        let err = CheckpointStore::load(&path).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_project(dir.path());
        let mut checkpoint = sample_checkpoint();
        checkpoint.schema_version = 99;
        let path = store.save(&checkpoint).await.unwrap();

        let err = CheckpointStore::load(&path).await.unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_inconsistent_totals_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_project(dir.path());
        let mut checkpoint = sample_checkpoint();
        checkpoint.progress.total_pages = 10;
        let path = store.save(&checkpoint).await.unwrap();

        let err = CheckpointStore::load(&path).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_resume_resets_in_progress_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::for_project(dir.path());
        let checkpoint = sample_checkpoint();
        let ids: Vec<String> = checkpoint.tasks.iter().map(|t| t.id.clone()).collect();

        let pool = Arc::new(BrowserSessionPool::new(Arc::new(FakeDriver::new()), 1));
        let engine = store.resume_from(checkpoint, pool, Arc::new(MockPageAnalyzer::new()));

        let summary = engine.get_progress_summary().await;
        assert_eq!(summary.workflow_id, "wf-1");
        assert_eq!(summary.status, WorkflowStatus::Pending);
        assert_eq!(summary.task_status(&ids[0]), Some(TaskStatus::Completed));
        assert_eq!(summary.task_status(&ids[1]), Some(TaskStatus::Pending));
        assert_eq!(summary.task_status(&ids[2]), Some(TaskStatus::Failed));
        assert_eq!(summary.task_status(&ids[3]), Some(TaskStatus::Pending));
        assert_eq!(summary.progress.completed_pages, 1);
        // The retryable failure is still pending work
        assert_eq!(summary.pending_pages, 3);
    }
}
