//! Library-level composition root.
//!
//! [`DeploymentService`] owns the store, the audit log, the recorder and the
//! scheduler, and exposes the operations a front end drives.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::audit_log::AuditLog;
use crate::config::DeployerConfig;
use crate::db::Database;
use crate::errors::DeployError;
use crate::models::{DeploymentHistoryRecord, DeploymentTask, ServerTarget};
use crate::progress::{progress_channel, ProgressReceiver, ProgressReporter, ProgressSink};
use crate::recorder::ResultRecorder;
use crate::state::TaskHandle;
use crate::task_worker::{DeploymentScheduler, ResultCallback};
use crate::transport::{create_session, Transport, TEST_CONNECT_TIMEOUT};

const CONNECTION_TEST_ID: &str = "connection-test";

pub struct DeploymentService {
    config: DeployerConfig,
    database: Arc<Mutex<Database>>,
    transport: Arc<dyn Transport>,
    audit: Arc<AuditLog>,
    recorder: ResultRecorder,
    scheduler: DeploymentScheduler,
}

impl DeploymentService {
    /// Opens the SQLite store named by the config. Must be called inside a tokio runtime.
    pub fn open(config: DeployerConfig, transport: Arc<dyn Transport>) -> Result<Self, DeployError> {
        let database = Database::open(&config.database_path).map_err(DeployError::Storage)?;
        Self::with_database(config, database, transport)
    }

    pub fn with_database(
        config: DeployerConfig,
        database: Database,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DeployError> {
        let runtime = Handle::try_current().map_err(|error| {
            DeployError::Config(format!("Deployment service needs a tokio runtime: {error}"))
        })?;

        let audit = Arc::new(AuditLog::new(&config.audit_log_dir));
        audit.ensure_dir()?;
        let removed = audit.cleanup_older_than(config.audit_retention_days);
        if removed > 0 {
            info!(removed, "Expired deployment audit logs removed");
        }

        let database = Arc::new(Mutex::new(database));
        let recorder = ResultRecorder::new(database.clone());
        let scheduler = DeploymentScheduler::new(runtime, transport.clone(), recorder.clone())
            .with_audit_log(audit.clone())
            .with_connect_timeout(config.connect_timeout())
            .with_max_concurrent_tasks(config.max_concurrent_tasks);

        info!(
            database = %config.database_path.display(),
            audit_dir = %config.audit_log_dir.display(),
            "Deployment service opened"
        );
        Ok(Self {
            config,
            database,
            transport,
            audit,
            recorder,
            scheduler,
        })
    }

    /// Cancels everything still running and releases the store.
    pub fn close(self) {
        let stopped = self.scheduler.stop_all();
        info!(stopped, "Deployment service closed");
    }

    fn database(&self) -> Result<MutexGuard<'_, Database>, DeployError> {
        self.database
            .lock()
            .map_err(|_| DeployError::Storage("Database lock poisoned".to_string()))
    }

    /// Opens and closes a session with a short timeout, reporting each step to `sink`.
    pub async fn test_connection(&self, target: ServerTarget, sink: Arc<dyn ProgressSink>) -> bool {
        let transport = self.transport.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let reporter = ProgressReporter::new(CONNECTION_TEST_ID, sink, None).for_server(&target);
            reporter.info(format!("Connecting to {}:{}", target.host, target.port));
            match create_session(transport.as_ref(), &target, TEST_CONNECT_TIMEOUT) {
                Ok(_guard) => {
                    reporter.info("Connection succeeded");
                    true
                }
                Err(error) => {
                    reporter.error(format!("Connection failed: {error}"));
                    false
                }
            }
        })
        .await;
        joined.unwrap_or_else(|error| {
            warn!("Connection test aborted: {error}");
            false
        })
    }

    /// Fire-and-forget: results stream to `on_result`, messages to `sink`.
    pub fn execute_deployment(
        &self,
        task: DeploymentTask,
        on_result: ResultCallback,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TaskHandle, DeployError> {
        self.scheduler.submit(task, on_result, sink)
    }

    /// Like [`Self::execute_deployment`], with progress delivered through a
    /// bounded channel sized and governed by the configuration.
    pub fn execute_deployment_with_channel(
        &self,
        task: DeploymentTask,
        on_result: ResultCallback,
    ) -> Result<(TaskHandle, ProgressReceiver), DeployError> {
        let (sink, receiver) =
            progress_channel(self.config.progress_capacity, self.config.progress_overflow);
        let handle = self.scheduler.submit(task, on_result, Arc::new(sink))?;
        Ok((handle, receiver))
    }

    pub fn cancel_deployment(&self, task_id: &str) -> bool {
        self.scheduler.cancel(task_id)
    }

    pub fn stop_all_deployments(&self) -> usize {
        self.scheduler.stop_all()
    }

    pub fn running_deployments(&self) -> Vec<String> {
        self.scheduler.in_flight_ids()
    }

    pub fn list_server_targets(&self) -> Result<Vec<ServerTarget>, DeployError> {
        self.database()?
            .list_server_targets()
            .map_err(DeployError::Storage)
    }

    pub fn get_server_target(&self, name: &str) -> Result<Option<ServerTarget>, DeployError> {
        self.database()?
            .get_server_target(name)
            .map_err(DeployError::Storage)
    }

    /// Upserts by name after validation.
    pub fn save_server_target(&self, target: &ServerTarget) -> Result<(), DeployError> {
        target.validate()?;
        self.database()?
            .upsert_server_target(target, Utc::now())
            .map_err(DeployError::Storage)?;
        info!(server = %target.name, "Server target saved");
        Ok(())
    }

    pub fn delete_server_target(&self, name: &str) -> Result<bool, DeployError> {
        let removed = self
            .database()?
            .delete_server_target(name)
            .map_err(DeployError::Storage)?;
        if removed {
            info!(server = name, "Server target deleted");
        }
        Ok(removed)
    }

    pub fn list_deployment_history(
        &self,
        limit: usize,
    ) -> Result<Vec<DeploymentHistoryRecord>, DeployError> {
        self.recorder.recent(limit)
    }

    pub fn cleanup_history(&self, days_to_keep: u32) -> Result<usize, DeployError> {
        self.recorder.cleanup(days_to_keep)
    }

    /// Today's audit log for a task, empty if nothing was written.
    pub fn read_task_log(&self, task_id: &str) -> String {
        self.audit.read(task_id)
    }
}
