use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::workflow::engine::WorkflowEngine;

/// Live workflows in this process, addressable by workflow id.
///
/// Control surfaces (the Ctrl-C handler, the CLI) look engines up here
/// instead of holding them directly.
#[derive(Default)]
pub struct WorkflowRegistry {
    engines: RwLock<HashMap<String, Arc<WorkflowEngine>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine, replacing any previous engine with the same id
    pub async fn register(&self, engine: Arc<WorkflowEngine>) {
        let id = engine.workflow_id().to_string();
        if self.engines.write().await.insert(id.clone(), engine).is_some() {
            warn!("Replaced previously registered workflow {}", id);
        }
    }

    pub async fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowEngine>> {
        self.engines.read().await.get(workflow_id).cloned()
    }

    pub async fn remove(&self, workflow_id: &str) -> Option<Arc<WorkflowEngine>> {
        self.engines.write().await.remove(workflow_id)
    }

    /// Ids of all registered workflows, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request a stop on every registered workflow that is still live.
    ///
    /// Returns how many workflows accepted the request.
    pub async fn stop_all(&self) -> usize {
        let engines: Vec<Arc<WorkflowEngine>> = self.engines.read().await.values().cloned().collect();

        let mut stopped = 0;
        for engine in engines {
            if engine.status().await.is_terminal() {
                continue;
            }
            match engine.stop().await {
                Ok(()) => {
                    info!("Stop requested for workflow {}", engine.workflow_id());
                    stopped += 1;
                }
                Err(e) => warn!("Could not stop workflow {}: {}", engine.workflow_id(), e),
            }
        }
        stopped
    }
}
