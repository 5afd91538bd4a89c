use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::analyzer::{AnalysisResult, PageAnalyzer};
use crate::browser::BrowserSessionPool;
use crate::cli::config::AppConfig;
use crate::error::{CheckpointError, WorkflowError};
use crate::storage::{CheckpointStore, ResultStore, WorkflowCheckpoint, CHECKPOINT_SCHEMA_VERSION};
use crate::workflow::progress::{ProgressSummary, WorkflowProgress};
use crate::workflow::task::{PageTask, TaskStatus};
use crate::workflow::WorkflowStatus;

const ACCEPTED_SCHEMES: &[&str] = &["http", "https", "file"];

/// Mutable workflow state. Only ever locked for synchronous updates.
struct EngineState {
    status: WorkflowStatus,
    tasks: Vec<PageTask>,
    progress: WorkflowProgress,
    /// Tasks finished since the last periodic checkpoint
    finished_since_checkpoint: usize,
}

impl EngineState {
    fn refresh(&mut self) {
        self.progress.refresh(&self.tasks);
    }

    /// Put tasks whose attempt was abandoned mid-flight back in the queue
    fn requeue_interrupted(&mut self) -> usize {
        let mut requeued = 0;
        for task in self.tasks.iter_mut().filter(|t| t.status == TaskStatus::InProgress) {
            debug!("Re-queueing interrupted page {}", task.url);
            task.status = TaskStatus::Pending;
            requeued += 1;
        }
        if requeued > 0 {
            self.refresh();
        }
        requeued
    }
}

/// Outcome of looking for the next task at a task boundary
enum Claim {
    Task(usize, PageTask),
    Exhausted,
    Interrupted,
}

/// Clears the loop flag however the processing loop exits
struct LoopGuard<'a>(&'a AtomicBool);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Closes an attempt's session if the attempt is dropped before it finishes
struct SessionGuard {
    pool: Arc<BrowserSessionPool>,
    key: Option<String>,
}

impl SessionGuard {
    fn new(pool: &Arc<BrowserSessionPool>, key: &str) -> Self {
        Self {
            pool: Arc::clone(pool),
            key: Some(key.to_string()),
        }
    }

    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    match pool.close_session(&key).await {
                        Ok(()) => debug!("Closed session '{}' of an abandoned attempt", key),
                        Err(e) => debug!("Abandoned session '{}' was already gone: {}", key, e),
                    }
                });
            }
            Err(_) => warn!("No runtime left to close abandoned session '{}'", key),
        }
    }
}

/// Sequential page-processing scheduler.
///
/// Tasks run one at a time in the order they were added. Control operations
/// (`pause`, `resume`, `stop`, `skip_current_page`, `get_progress_summary`)
/// may be called from other tasks while `start` is running; they only take
/// the state lock briefly and never wait on browser I/O.
pub struct WorkflowEngine {
    workflow_id: String,
    project_id: String,
    project_root: PathBuf,
    config: AppConfig,
    pool: Arc<BrowserSessionPool>,
    analyzer: Arc<dyn PageAnalyzer>,
    checkpoints: CheckpointStore,
    results: ResultStore,
    state: Mutex<EngineState>,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    wake: Notify,
    loop_active: AtomicBool,
    status_tx: watch::Sender<WorkflowStatus>,
    checkpoint_writer: Mutex<()>,
}

impl WorkflowEngine {
    /// Create an empty workflow for the project rooted at `project_root`
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: AppConfig,
        pool: Arc<BrowserSessionPool>,
        analyzer: Arc<dyn PageAnalyzer>,
    ) -> Self {
        let project_root = project_root.into();
        let project_id = project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        Self::build(
            Uuid::new_v4().to_string(),
            project_id,
            project_root,
            config,
            pool,
            analyzer,
            EngineState {
                status: WorkflowStatus::Pending,
                tasks: Vec::new(),
                progress: WorkflowProgress::new(0),
                finished_since_checkpoint: 0,
            },
        )
    }

    /// Rebuild a workflow from a checkpoint. Interrupted tasks restart as pending.
    pub(crate) fn restore(
        checkpoint: WorkflowCheckpoint,
        project_root: PathBuf,
        pool: Arc<BrowserSessionPool>,
        analyzer: Arc<dyn PageAnalyzer>,
    ) -> Self {
        let mut state = EngineState {
            status: WorkflowStatus::Pending,
            tasks: checkpoint.tasks,
            progress: checkpoint.progress,
            finished_since_checkpoint: 0,
        };
        state.progress.current_index = None;
        state.progress.current_url = None;
        state.progress.end_time = None;
        state.requeue_interrupted();
        state.refresh();

        Self::build(
            checkpoint.workflow_id,
            checkpoint.project_id,
            project_root,
            checkpoint.config_snapshot,
            pool,
            analyzer,
            state,
        )
    }

    /// Load `workflow_id` from the checkpoints of the project at `project_root`
    pub async fn load_from_checkpoint(
        project_root: impl Into<PathBuf>,
        workflow_id: &str,
        pool: Arc<BrowserSessionPool>,
        analyzer: Arc<dyn PageAnalyzer>,
    ) -> Result<Self, WorkflowError> {
        let store = CheckpointStore::for_project(project_root);
        let checkpoint = store.load_workflow(workflow_id).await?;
        Ok(store.resume_from(checkpoint, pool, analyzer))
    }

    fn build(
        workflow_id: String,
        project_id: String,
        project_root: PathBuf,
        config: AppConfig,
        pool: Arc<BrowserSessionPool>,
        analyzer: Arc<dyn PageAnalyzer>,
        state: EngineState,
    ) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        Self {
            workflow_id,
            project_id,
            checkpoints: CheckpointStore::for_project(project_root.clone()),
            results: ResultStore::new(project_root.clone()),
            project_root,
            config,
            pool,
            analyzer,
            state: Mutex::new(state),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            wake: Notify::new(),
            loop_active: AtomicBool::new(false),
            status_tx,
            checkpoint_writer: Mutex::new(()),
        }
    }

    /// Use a caller-chosen workflow id instead of a random one
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Where this workflow's checkpoint is written
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoints.path_for(&self.workflow_id)
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.state.lock().await.status
    }

    /// Create one task per URL. Only legal once, before the workflow starts.
    ///
    /// A URL listed twice becomes two tasks with the same page id. Both are
    /// processed, and they share one result file, so the later run's result
    /// replaces the earlier one.
    pub async fn add_page_urls<I, S>(&self, urls: I, max_attempts: u32) -> Result<usize, WorkflowError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        if state.status != WorkflowStatus::Pending {
            return Err(WorkflowError::InvalidState {
                operation: "add page URLs",
                status: state.status,
            });
        }
        if !state.tasks.is_empty() {
            return Err(WorkflowError::TasksAlreadyAdded);
        }

        let tasks = urls
            .into_iter()
            .map(|url| {
                let url = url.as_ref().trim();
                validate_url(url)?;
                Ok(PageTask::new(url, max_attempts))
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        let added = tasks.len();
        state.tasks = tasks;
        state.progress = WorkflowProgress::new(added);
        state.refresh();

        info!("Added {} page(s) to workflow {}", added, self.workflow_id);
        Ok(added)
    }

    /// Run the workflow until every task is finished or `stop` is called.
    ///
    /// Only structural problems are returned as errors; page failures are
    /// recorded on their tasks and reflected in the returned summary.
    pub async fn start(&self) -> Result<ProgressSummary, WorkflowError> {
        {
            let state = self.state.lock().await;
            if state.tasks.is_empty() {
                return Err(WorkflowError::NoTasks);
            }
            if state.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    operation: "start",
                    status: state.status,
                });
            }
        }

        fs::create_dir_all(self.results.pages_dir()).await?;
        fs::create_dir_all(self.checkpoints.checkpoints_dir()).await?;

        let total = {
            let mut state = self.state.lock().await;
            if state.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    operation: "start",
                    status: state.status,
                });
            }
            state.status = WorkflowStatus::Running;
            state.progress.start_time.get_or_insert_with(Utc::now);
            state.refresh();
            self.loop_active.store(true, Ordering::SeqCst);
            state.tasks.len()
        };
        self.status_tx.send_replace(WorkflowStatus::Running);

        info!(
            "Starting workflow {} for project {} ({} page(s))",
            self.workflow_id, self.project_id, total
        );

        Ok(self.run_loop().await)
    }

    /// Stop starting new tasks. The in-flight task keeps running.
    pub async fn pause(&self) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        let status = state.status;
        match status {
            WorkflowStatus::Running => {
                state.status = WorkflowStatus::Paused;
                self.pause_requested.store(true, Ordering::SeqCst);
            }
            WorkflowStatus::Paused => return Ok(()),
            status => {
                return Err(WorkflowError::InvalidState {
                    operation: "pause",
                    status,
                })
            }
        }
        drop(state);

        self.status_tx.send_replace(WorkflowStatus::Paused);
        info!("Pause requested for workflow {}", self.workflow_id);
        Ok(())
    }

    /// Continue a paused workflow, relaunching the loop if its caller gave up on it
    pub async fn resume(self: &Arc<Self>) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        let status = state.status;
        match status {
            WorkflowStatus::Paused => {
                state.status = WorkflowStatus::Running;
                self.pause_requested.store(false, Ordering::SeqCst);
            }
            WorkflowStatus::Running => return Ok(()),
            status => {
                return Err(WorkflowError::InvalidState {
                    operation: "resume",
                    status,
                })
            }
        }
        let relaunch = !self.loop_active.swap(true, Ordering::SeqCst);
        if relaunch {
            // Nothing is in flight without a loop
            let requeued = state.requeue_interrupted();
            if requeued > 0 {
                warn!("Re-queued {} page(s) whose attempt was abandoned", requeued);
            }
        }
        drop(state);

        self.status_tx.send_replace(WorkflowStatus::Running);
        info!("Resuming workflow {}", self.workflow_id);

        if !relaunch {
            self.wake.notify_one();
        } else {
            debug!("Processing loop for {} is not running, relaunching", self.workflow_id);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_loop().await;
            });
        }

        Ok(())
    }

    /// Cancel the workflow once the in-flight attempt (if any) finishes
    pub async fn stop(&self) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        let status = state.status;
        match status {
            WorkflowStatus::Cancelled => return Ok(()),
            WorkflowStatus::Completed => {
                return Err(WorkflowError::InvalidState {
                    operation: "stop",
                    status: WorkflowStatus::Completed,
                })
            }
            WorkflowStatus::Pending => {
                self.stop_requested.store(true, Ordering::SeqCst);
                state.status = WorkflowStatus::Cancelled;
                state.progress.end_time = Some(Utc::now());
                state.refresh();
                drop(state);

                info!("Workflow {} cancelled before it started", self.workflow_id);
                self.write_checkpoint().await;
                self.status_tx.send_replace(WorkflowStatus::Cancelled);
                return Ok(());
            }
            WorkflowStatus::Running | WorkflowStatus::Paused => {
                self.stop_requested.store(true, Ordering::SeqCst);
            }
        }
        drop(state);

        info!("Stop requested for workflow {}", self.workflow_id);
        self.wake.notify_one();

        // A loop that completed in the meantime wins: finish keeps terminal statuses
        if !self.loop_active.load(Ordering::SeqCst) {
            self.finish(WorkflowStatus::Cancelled).await;
        }

        Ok(())
    }

    /// Mark the task currently being processed as skipped.
    ///
    /// Returns the id of the skipped task, or `None` if nothing was in flight.
    pub async fn skip_current_page(&self) -> Result<Option<String>, WorkflowError> {
        let mut state = self.state.lock().await;
        if state.status != WorkflowStatus::Running {
            return Err(WorkflowError::InvalidState {
                operation: "skip the current page",
                status: state.status,
            });
        }

        let Some(index) = state.progress.current_index else {
            return Ok(None);
        };
        let skipped = match state.tasks.get_mut(index) {
            Some(task) if !task.is_terminal() => {
                task.mark_skipped();
                info!("Skipped page {}", task.url);
                Some(task.id.clone())
            }
            _ => None,
        };
        if skipped.is_some() {
            state.finished_since_checkpoint += 1;
            state.refresh();
        }
        drop(state);

        self.wake.notify_one();
        Ok(skipped)
    }

    /// Snapshot of progress and per-task status
    pub async fn get_progress_summary(&self) -> ProgressSummary {
        let state = self.state.lock().await;
        ProgressSummary::new(&self.workflow_id, state.status, &state.progress, &state.tasks)
    }

    /// Resolve once the workflow is completed or cancelled
    pub async fn wait_until_finished(&self) -> WorkflowStatus {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        let status = *rx.borrow();
        status
    }

    /// Build a checkpoint of the current state
    pub async fn checkpoint(&self) -> WorkflowCheckpoint {
        let state = self.state.lock().await;
        WorkflowCheckpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            project_id: self.project_id.clone(),
            workflow_id: self.workflow_id.clone(),
            created_at: Utc::now(),
            status: state.status,
            tasks: state.tasks.clone(),
            progress: state.progress.clone(),
            config_snapshot: self.config.clone(),
        }
    }

    /// Write a checkpoint now
    pub async fn save_checkpoint(&self) -> Result<PathBuf, CheckpointError> {
        let _writer = self.checkpoint_writer.lock().await;
        let checkpoint = self.checkpoint().await;
        self.checkpoints.save(&checkpoint).await
    }

    async fn write_checkpoint(&self) {
        if let Err(e) = self.save_checkpoint().await {
            error!("Failed to write checkpoint for workflow {}: {}", self.workflow_id, e);
        }
    }

    async fn run_loop(&self) -> ProgressSummary {
        let _guard = LoopGuard(&self.loop_active);

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                return self.finish(WorkflowStatus::Cancelled).await;
            }
            if self.pause_requested.load(Ordering::SeqCst) {
                self.wait_while_paused().await;
                continue;
            }

            match self.claim_next_task().await {
                Claim::Task(index, task) => {
                    self.process_task(index, task).await;
                    self.checkpoint_if_due().await;
                }
                Claim::Exhausted => return self.finish(WorkflowStatus::Completed).await,
                Claim::Interrupted => continue,
            }
        }
    }

    /// Pick the first runnable task in insertion order and mark it in progress
    async fn claim_next_task(&self) -> Claim {
        let mut state = self.state.lock().await;
        if state.status != WorkflowStatus::Running || self.stop_requested.load(Ordering::SeqCst) {
            return Claim::Interrupted;
        }

        // Only the loop marks tasks in progress, so any left over between
        // tasks belong to an attempt that was dropped
        state.requeue_interrupted();

        let Some(index) = state.tasks.iter().position(PageTask::is_runnable) else {
            return Claim::Exhausted;
        };

        let task = &mut state.tasks[index];
        task.mark_in_progress();
        let claimed = task.clone();

        state.progress.current_index = Some(index);
        state.progress.current_url = Some(claimed.url.clone());
        state.refresh();

        Claim::Task(index, claimed)
    }

    async fn wait_while_paused(&self) {
        info!("Workflow {} paused", self.workflow_id);
        self.write_checkpoint().await;

        loop {
            if self.stop_requested.load(Ordering::SeqCst) || !self.pause_requested.load(Ordering::SeqCst) {
                break;
            }
            self.wake.notified().await;
        }

        debug!("Workflow {} leaving pause", self.workflow_id);
    }

    /// Attempt a task until it completes, is skipped, runs out of attempts,
    /// or a stop interrupts its backoff
    async fn process_task(&self, index: usize, task: PageTask) {
        info!("Processing page {}: {}", index + 1, task.url);

        loop {
            let outcome = match self.attempt(&task).await {
                Ok(result) => {
                    if self.is_skipped(index).await {
                        info!("Discarding result for skipped page {}", task.url);
                        return;
                    }
                    self.results
                        .save(&task.id, &result)
                        .await
                        .map_err(|e| format!("failed to persist result: {}", e))
                }
                Err(message) => Err(message),
            };

            let retry_after = {
                let mut state = self.state.lock().await;
                let current = &mut state.tasks[index];
                if current.status == TaskStatus::Skipped {
                    return;
                }

                let retry_after = match outcome {
                    Ok(result_ref) => {
                        current.mark_completed(result_ref);
                        info!("Completed page {}", current.url);
                        None
                    }
                    Err(message) => {
                        if current.record_failure(message.as_str()) {
                            error!(
                                "Page {} failed after {} attempt(s): {}",
                                current.url, current.attempts, message
                            );
                            None
                        } else {
                            warn!(
                                "Attempt {}/{} for {} failed: {}",
                                current.attempts, current.max_attempts, current.url, message
                            );
                            Some(current.attempts)
                        }
                    }
                };
                if retry_after.is_none() {
                    state.finished_since_checkpoint += 1;
                }
                state.refresh();
                retry_after
            };

            let Some(attempts) = retry_after else {
                return;
            };

            let delay = self.config.workflow.retry.next_delay(attempts);
            debug!("Retrying {} in {:?}", task.url, delay);
            if !self.backoff(index, delay).await {
                return;
            }

            let mut state = self.state.lock().await;
            let current = &mut state.tasks[index];
            if current.status == TaskStatus::Skipped {
                return;
            }
            current.mark_in_progress();
            state.refresh();
        }
    }

    /// One attempt: open a session, navigate, analyze, and always close the session
    async fn attempt(&self, task: &PageTask) -> Result<AnalysisResult, String> {
        let key = format!("{}:{}", self.workflow_id, task.id);
        let browser = &self.config.browser;

        self.pool
            .create_session(&key, browser.engine, browser.headless)
            .await
            .map_err(|e| e.to_string())?;
        let session = SessionGuard::new(&self.pool, &key);

        let outcome = self.navigate_and_analyze(&key, task).await;

        let closed = self.pool.close_session(&key).await;
        session.disarm();
        if let Err(e) = closed {
            debug!("Session for {} was already gone: {}", task.url, e);
        }

        outcome
    }

    async fn navigate_and_analyze(&self, key: &str, task: &PageTask) -> Result<AnalysisResult, String> {
        let page = self
            .pool
            .navigate_page(key, &task.url)
            .await
            .map_err(|e| e.to_string())?;
        debug!("Loaded {} in session {}", task.url, page.session_id());

        self.analyzer
            .analyze(&page, &task.url, &self.project_root)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    /// Sleep before a retry. Returns `false` if the retry should be abandoned.
    async fn backoff(&self, index: usize, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) || self.is_skipped(index).await {
                return false;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return !self.stop_requested.load(Ordering::SeqCst);
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn is_skipped(&self, index: usize) -> bool {
        let state = self.state.lock().await;
        state
            .tasks
            .get(index)
            .map_or(false, |t| t.status == TaskStatus::Skipped)
    }

    async fn checkpoint_if_due(&self) {
        let due = {
            let mut state = self.state.lock().await;
            let interval = self.config.workflow.checkpoint_interval.max(1);
            if state.finished_since_checkpoint >= interval {
                state.finished_since_checkpoint = 0;
                true
            } else {
                false
            }
        };

        if due {
            self.write_checkpoint().await;
        }
    }

    /// Enter a terminal status. A workflow that is already terminal keeps its status.
    async fn finish(&self, status: WorkflowStatus) -> ProgressSummary {
        let entered = {
            let mut state = self.state.lock().await;
            if state.status.is_terminal() {
                false
            } else {
                state.status = status;
                state.progress.end_time = Some(Utc::now());
                state.requeue_interrupted();
                state.refresh();
                true
            }
        };
        if !entered {
            debug!("Workflow {} already finished, ignoring {}", self.workflow_id, status);
            return self.get_progress_summary().await;
        }

        self.write_checkpoint().await;
        self.status_tx.send_replace(status);

        let summary = self.get_progress_summary().await;
        info!(
            "Workflow {} {}: {} completed, {} failed, {} skipped, {} pending",
            self.workflow_id,
            status,
            summary.progress.completed_pages,
            summary.progress.failed_pages,
            summary.progress.skipped_pages,
            summary.pending_pages
        );
        summary
    }
}

fn validate_url(url: &str) -> Result<(), WorkflowError> {
    let invalid = |reason: String| WorkflowError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !ACCEPTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    Ok(())
}
