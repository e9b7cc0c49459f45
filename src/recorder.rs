use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::DeployError;
use crate::models::{DeploymentHistoryRecord, DeploymentResult, DeploymentTask};

/// Durable history backend.
pub trait HistoryStore: Send + Sync {
    fn save(&self, record: &DeploymentHistoryRecord) -> Result<i64, DeployError>;
    fn find_recent(&self, limit: usize) -> Result<Vec<DeploymentHistoryRecord>, DeployError>;
    fn delete_older_than(&self, days: u32) -> Result<usize, DeployError>;
}

/// Turns finished per-server results into history rows as they arrive.
#[derive(Clone)]
pub struct ResultRecorder {
    store: Arc<dyn HistoryStore>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub fn build_record(result: &DeploymentResult, task: &DeploymentTask) -> DeploymentHistoryRecord {
        let package_size = std::fs::metadata(&task.local_package_path)
            .map(|meta| meta.len())
            .unwrap_or(result.uploaded_bytes);
        DeploymentHistoryRecord {
            id: None,
            task_id: result.task_id.clone(),
            server_name: result.server.name.clone(),
            server_host: result.server.host.clone(),
            package_name: task.package_file_name(),
            package_size,
            success: result.success,
            error_message: result.error_message.clone(),
            started_at: result.started_at,
            ended_at: result.ended_at,
            duration_millis: result.duration_millis(),
            backup_file_path: result.backup_file_path.clone(),
            deployed_files: result.deployed_files.clone(),
            task_description: task.description.clone(),
            created_at: Utc::now(),
        }
    }

    /// Persists one result. A storage failure is logged and reported as `false`;
    /// it never affects the deployment outcome.
    pub fn record(&self, result: &DeploymentResult, task: &DeploymentTask) -> bool {
        let record = Self::build_record(result, task);
        match self.store.save(&record) {
            Ok(id) => {
                info!(
                    task_id = %record.task_id,
                    server = %record.server_name,
                    history_id = id,
                    success = record.success,
                    "Deployment result recorded"
                );
                true
            }
            Err(error) => {
                warn!(
                    task_id = %record.task_id,
                    server = %record.server_name,
                    "Failed to record deployment result: {error}"
                );
                false
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<DeploymentHistoryRecord>, DeployError> {
        self.store.find_recent(limit)
    }

    pub fn cleanup(&self, days_to_keep: u32) -> Result<usize, DeployError> {
        let removed = self.store.delete_older_than(days_to_keep)?;
        info!(removed, days_to_keep, "Deployment history cleaned up");
        Ok(removed)
    }
}
