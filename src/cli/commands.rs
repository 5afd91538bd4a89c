use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::analyzer::HtmlPageAnalyzer;
use crate::browser::{BrowserSessionPool, WebDriverDriver};
use crate::cli::config::AppConfig;
use crate::storage::{CheckpointStore, ResultStore};
use crate::workflow::{PageTask, ProgressSummary, WorkflowEngine, WorkflowRegistry};

/// Start a new workflow over the given URLs
pub async fn run(
    project: PathBuf,
    config_path: Option<PathBuf>,
    urls_file: Option<PathBuf>,
    mut urls: Vec<String>,
) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;

    if let Some(file) = urls_file {
        urls.extend(read_urls_file(&file).await?);
    }
    if urls.is_empty() {
        bail!("No page URLs given. Pass them as arguments or with --urls-file");
    }

    let pool = build_pool(&config);
    let analyzer = Arc::new(HtmlPageAnalyzer::new(config.analyzer.max_links));
    let engine = Arc::new(WorkflowEngine::new(
        &project,
        config.clone(),
        Arc::clone(&pool),
        analyzer,
    ));

    let added = engine
        .add_page_urls(&urls, config.workflow.max_retries)
        .await?;
    info!("Workflow {} created with {} page(s)", engine.workflow_id(), added);
    println!("Workflow ID: {}", engine.workflow_id());

    drive(engine, pool).await
}

/// Continue a workflow from its checkpoint
pub async fn resume(project: PathBuf, workflow_id: String) -> Result<()> {
    let store = CheckpointStore::for_project(&project);
    let checkpoint = store
        .load_workflow(&workflow_id)
        .await
        .context(format!("Failed to load checkpoint for workflow {}", workflow_id))?;

    if checkpoint.status.is_terminal() {
        info!("Workflow {} was {}, picking up any remaining pages", workflow_id, checkpoint.status);
    }

    let config = checkpoint.config_snapshot.clone();
    let pool = build_pool(&config);
    let analyzer = Arc::new(HtmlPageAnalyzer::new(config.analyzer.max_links));
    let engine = Arc::new(store.resume_from(checkpoint, Arc::clone(&pool), analyzer));

    drive(engine, pool).await
}

/// Print the checkpointed state of a workflow without running it
pub async fn status(project: PathBuf, workflow_id: String, results: bool) -> Result<()> {
    let store = CheckpointStore::for_project(&project);
    let checkpoint = store
        .load_workflow(&workflow_id)
        .await
        .context(format!("Failed to load checkpoint for workflow {}", workflow_id))?;

    let summary = ProgressSummary::new(
        &checkpoint.workflow_id,
        checkpoint.status,
        &checkpoint.progress,
        &checkpoint.tasks,
    );
    println!("Checkpoint taken: {}", checkpoint.created_at);
    print_summary(&summary);

    if results {
        print_results(&ResultStore::new(&project), &checkpoint.tasks).await;
    }

    Ok(())
}

/// List stored results, returning how many could be read back
async fn print_results(store: &ResultStore, tasks: &[PageTask]) -> usize {
    let mut readable = 0;

    println!("Results:");
    for task in tasks {
        let Some(result_ref) = task.result_ref.as_deref() else {
            continue;
        };
        let path = store.resolve(result_ref);
        match store.load(result_ref).await {
            Ok(result) => {
                readable += 1;
                let title = result.title.as_deref().unwrap_or("(untitled)");
                println!("  - {} -> {} [{}]", task.url, path.display(), title);
            }
            Err(e) => {
                warn!("Result for {} is unreadable: {}", task.url, e);
                println!("  - {} -> {} (unreadable)", task.url, path.display());
            }
        }
    }

    readable
}

/// Write a default configuration file
pub async fn init_config(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(AppConfig::default_path);
    if path.exists() {
        warn!("Overwriting existing configuration at {}", path.display());
    }
    AppConfig::default().save_to_file(&path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}

/// Print the effective configuration as YAML
pub async fn show_config(path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(path.as_deref())?;
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}

/// Run a workflow to the end with Ctrl-C mapped to a graceful stop
async fn drive(engine: Arc<WorkflowEngine>, pool: Arc<BrowserSessionPool>) -> Result<()> {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(Arc::clone(&engine)).await;

    let signal_registry = Arc::clone(&registry);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current page");
            signal_registry.stop_all().await;
        }
    });

    let outcome = engine.start().await;

    interrupt.abort();
    registry.remove(engine.workflow_id()).await;
    if let Err(e) = pool.shutdown().await {
        warn!("Browser pool shutdown failed: {}", e);
    }

    let summary = outcome?;
    print_summary(&summary);
    println!("Checkpoint: {}", engine.checkpoint_path().display());

    if summary.pending_pages > 0 {
        println!(
            "Resume with: workflow resume --project {} {}",
            engine.project_root().display(),
            engine.workflow_id()
        );
    }

    Ok(())
}

fn build_pool(config: &AppConfig) -> Arc<BrowserSessionPool> {
    let driver = WebDriverDriver::new(config.browser.webdriver_url.clone(), config.browser.page_load_timeout());
    Arc::new(BrowserSessionPool::new(
        Arc::new(driver),
        config.browser.max_concurrent_sessions,
    ))
}

/// One URL per line. Blank lines and `#` comments are ignored.
async fn read_urls_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .await
        .context(format!("Failed to read URL file: {}", path.display()))?;

    Ok(parse_url_list(&contents))
}

fn parse_url_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn print_summary(summary: &ProgressSummary) {
    let progress = &summary.progress;

    println!("Workflow ID: {}", summary.workflow_id);
    println!("Status: {}", summary.status);
    println!(
        "Pages: {} total, {} completed, {} failed, {} skipped, {} pending ({:.1}%)",
        progress.total_pages,
        progress.completed_pages,
        progress.failed_pages,
        progress.skipped_pages,
        summary.pending_pages,
        summary.completion_percentage
    );
    if let Some(started) = progress.start_time {
        println!("Started: {}", started);
    }
    if let Some(ended) = progress.end_time {
        println!("Ended: {}", ended);
    } else if let Some(eta) = progress.estimated_completion {
        println!("Estimated completion: {}", eta);
    }

    let failures: Vec<_> = summary
        .tasks
        .iter()
        .filter_map(|t| t.error_message.as_ref().map(|e| (t, e)))
        .collect();
    if !failures.is_empty() {
        println!("Errors:");
        for (task, error) in failures {
            println!("  - [{}] {} ({} attempt(s)): {}", task.status, task.url, task.attempts, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{WorkflowCheckpoint, CHECKPOINT_SCHEMA_VERSION};
    use crate::analyzer::AnalysisResult;
    use crate::workflow::{WorkflowProgress, WorkflowStatus};
    use chrono::Utc;

    #[test]
    fn test_parse_url_list() {
        let contents = "# legacy intranet\nhttps://a.example.com/\n\n   https://b.example.com/x.asp  \n#https://skip.example.com/\n";
        assert_eq!(
            parse_url_list(contents),
            vec!["https://a.example.com/".to_string(), "https://b.example.com/x.asp".to_string()]
        );
    }

    #[tokio::test]
    async fn test_read_urls_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio_test::assert_err!(read_urls_file(&dir.path().join("missing.txt")).await);

        let listed = dir.path().join("urls.txt");
        std::fs::write(&listed, "https://a.example.com/\n").unwrap();
        let urls = tokio_test::assert_ok!(read_urls_file(&listed).await);
        assert_eq!(urls, vec!["https://a.example.com/".to_string()]);
    }

    #[tokio::test]
    async fn test_run_without_urls_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        AppConfig::default().save_to_file(&config).unwrap();

        let err = run(dir.path().join("project"), Some(config), None, Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No page URLs"));
    }

    #[tokio::test]
    async fn test_status_reads_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![PageTask::new("https://a.example.com/", 3)];
        let mut progress = WorkflowProgress::new(1);
        progress.refresh(&tasks);
        let checkpoint = WorkflowCheckpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            project_id: "acme".to_string(),
            workflow_id: "wf-status".to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Paused,
            tasks,
            progress,
            config_snapshot: AppConfig::default(),
        };
        CheckpointStore::for_project(dir.path()).save(&checkpoint).await.unwrap();

        status(dir.path().to_path_buf(), "wf-status".to_string(), false).await.unwrap();
        assert!(status(dir.path().to_path_buf(), "unknown".to_string(), false).await.is_err());
    }

    #[tokio::test]
    async fn test_print_results_reads_stored_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());

        let mut saved = AnalysisResult::new("https://a.example.com/", serde_json::json!({}));
        saved.title = Some("Intranet home".to_string());
        let mut done = PageTask::new("https://a.example.com/", 3);
        done.mark_in_progress();
        let result_ref = store.save(&done.id, &saved).await.unwrap();
        done.mark_completed(result_ref);

        let mut lost = PageTask::new("https://b.example.com/", 3);
        lost.mark_in_progress();
        lost.mark_completed(ResultStore::result_ref(&lost.id));

        let pending = PageTask::new("https://c.example.com/", 3);

        assert_eq!(print_results(&store, &[done, lost, pending]).await, 1);
    }
}
