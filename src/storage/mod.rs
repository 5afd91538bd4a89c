pub mod checkpoint;
pub mod results;

use std::path::Path;
use tokio::fs;

// Re-export common types
pub use checkpoint::{CheckpointStore, WorkflowCheckpoint, CHECKPOINT_SCHEMA_VERSION};
pub use results::ResultStore;

/// Write `contents` to `path` so readers never observe a partial file:
/// the data goes to a sibling temp file which is then renamed into place.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp_path = path.with_file_name(tmp_name);

    if let Err(e) = fs::write(&tmp_path, contents).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    Ok(())
}
