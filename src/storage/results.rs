use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::analyzer::AnalysisResult;
use crate::storage::write_atomic;

const PAGES_DIR: &str = "analysis/pages";

/// Persists one result file per analyzed page under `<project>/analysis/pages/`
#[derive(Debug, Clone)]
pub struct ResultStore {
    project_root: PathBuf,
}

impl ResultStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.project_root.join(PAGES_DIR)
    }

    /// Reference recorded on the task for a given page id
    pub fn result_ref(page_id: &str) -> String {
        format!("{}/{}.json", PAGES_DIR, page_id)
    }

    /// Write the result for `page_id`, returning its project-relative reference
    pub async fn save(&self, page_id: &str, result: &AnalysisResult) -> io::Result<String> {
        let result_ref = Self::result_ref(page_id);
        let path = self.project_root.join(&result_ref);
        let contents = serde_json::to_vec_pretty(result)?;

        write_atomic(&path, &contents).await?;
        debug!("Stored page result: {}", path.display());

        Ok(result_ref)
    }

    /// Read a previously stored result back
    pub async fn load(&self, result_ref: &str) -> io::Result<AnalysisResult> {
        let contents = fs::read(self.resolve(result_ref)).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    pub fn resolve(&self, result_ref: &str) -> PathBuf {
        self.project_root.join(Path::new(result_ref))
    }
}
