use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::audit_log::AuditLog;
use crate::errors::DeployError;
use crate::models::{DeploymentResult, DeploymentTask, TaskStatus};
use crate::pipeline::deploy_to_server;
use crate::progress::{ProgressLevel, ProgressReporter, ProgressSink};
use crate::recorder::ResultRecorder;
use crate::state::{lock_task, task_runtime, TaskHandle, TaskRuntime};
use crate::transport::{Transport, CONNECT_TIMEOUT};

/// Receives each per-server result as soon as that server is done.
pub type ResultCallback = Box<dyn FnMut(DeploymentResult) + Send>;

type InFlightMap = Arc<DashMap<String, TaskHandle>>;

/// Runs each submitted task on its own blocking worker. Servers within a task
/// are processed one after another, in list order.
pub struct DeploymentScheduler {
    runtime: Handle,
    transport: Arc<dyn Transport>,
    recorder: ResultRecorder,
    audit: Option<Arc<AuditLog>>,
    connect_timeout: Duration,
    limiter: Option<Arc<Semaphore>>,
    in_flight: InFlightMap,
}

impl DeploymentScheduler {
    pub fn new(runtime: Handle, transport: Arc<dyn Transport>, recorder: ResultRecorder) -> Self {
        Self {
            runtime,
            transport,
            recorder,
            audit: None,
            connect_timeout: CONNECT_TIMEOUT,
            limiter: None,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Caps how many tasks run at once. Tasks over the cap wait for a slot.
    pub fn with_max_concurrent_tasks(mut self, limit: Option<usize>) -> Self {
        self.limiter = limit.map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Assigns a task id if missing, marks the task running and schedules it.
    /// Returns immediately; results arrive through `on_result`.
    pub fn submit(
        &self,
        mut task: DeploymentTask,
        on_result: ResultCallback,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TaskHandle, DeployError> {
        if task.local_package_path.as_os_str().is_empty() {
            return Err(DeployError::Validation(
                "Local package path cannot be empty".to_string(),
            ));
        }
        if task.task_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            task.task_id = Some(uuid::Uuid::new_v4().to_string());
        }
        let task_id = task.task_id().to_string();
        if !task.advance(TaskStatus::Running) {
            return Err(DeployError::Validation(format!(
                "Task `{task_id}` cannot be started from status {}",
                task.status()
            )));
        }

        let (handle, runtime) = task_runtime(task);
        match self.in_flight.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                return Err(DeployError::Validation(format!(
                    "Task `{task_id}` is already running"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        let worker = TaskWorker {
            task: runtime.task.clone(),
            cancelled: runtime.cancelled.clone(),
            transport: self.transport.clone(),
            recorder: self.recorder.clone(),
            reporter: ProgressReporter::new(&task_id, sink, self.audit.clone()),
            connect_timeout: self.connect_timeout,
            on_result,
        };
        let limiter = self.limiter.clone();
        let in_flight = self.in_flight.clone();
        info!(task_id = %task_id, "Deployment task accepted");

        self.runtime.spawn(async move {
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };
            supervise(task_id, worker, runtime, in_flight).await;
        });
        Ok(handle)
    }

    /// Requests cooperative cancellation. Unknown ids are ignored and yield `false`.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some((_, handle)) = self.in_flight.remove(task_id) else {
            debug!(task_id, "Cancel requested for unknown task");
            return false;
        };
        handle.request_cancel();
        self.note_cancelled(task_id);
        true
    }

    /// Cancels every tracked task and clears the tracking table.
    pub fn stop_all(&self) -> usize {
        let mut handles = Vec::new();
        self.in_flight.retain(|_, handle| {
            handles.push(handle.clone());
            false
        });
        for handle in &handles {
            handle.request_cancel();
            self.note_cancelled(handle.task_id());
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "Stopped all in-flight deployments");
        }
        handles.len()
    }

    pub fn in_flight_ids(&self) -> Vec<String> {
        let mut ids = self
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn note_cancelled(&self, task_id: &str) {
        info!(task_id, "Deployment task cancellation requested");
        if let Some(audit) = &self.audit {
            audit.append(task_id, ProgressLevel::Info, "Deployment task cancelled");
        }
    }
}

async fn supervise(task_id: String, worker: TaskWorker, runtime: TaskRuntime, in_flight: InFlightMap) {
    let reporter = worker.reporter.clone();
    let joined = tokio::task::spawn_blocking(move || worker.run()).await;
    if let Err(join_error) = joined {
        error!(task_id = %task_id, "Deployment worker aborted: {join_error}");
        lock_task(&runtime.task).advance(TaskStatus::Failed);
        reporter.error(format!("Deployment task aborted: {join_error}"));
    }

    // A cancelled id may already have been reused by a newer submission.
    in_flight.remove_if(&task_id, |_, handle| handle.belongs_to(&runtime));
    runtime.mark_finished();
}

struct TaskWorker {
    task: Arc<Mutex<DeploymentTask>>,
    cancelled: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    recorder: ResultRecorder,
    reporter: ProgressReporter,
    connect_timeout: Duration,
    on_result: ResultCallback,
}

impl TaskWorker {
    fn run(mut self) {
        let snapshot = lock_task(&self.task).clone();
        let enabled = snapshot.enabled_targets().count();
        self.reporter.info(format!(
            "Deployment task started: {} to {enabled} of {} server(s)",
            snapshot.package_file_name(),
            snapshot.target_servers.len()
        ));

        let mut stopped_early = false;
        for target in &snapshot.target_servers {
            if !target.enabled {
                debug!(task_id = %self.reporter.task_id(), server = %target.name, "Skipping disabled server");
                continue;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                stopped_early = true;
                break;
            }

            let result = deploy_to_server(
                self.transport.as_ref(),
                &snapshot,
                target,
                &self.reporter,
                self.connect_timeout,
            );
            self.recorder.record(&result, &snapshot);
            (self.on_result)(result);
        }

        if stopped_early {
            lock_task(&self.task).advance(TaskStatus::Cancelled);
            self.reporter
                .warn("Deployment task cancelled, remaining servers were not started");
        } else {
            lock_task(&self.task).advance(TaskStatus::Completed);
            self.reporter.info("Deployment task finished");
        }
    }
}
