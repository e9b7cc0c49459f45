use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::models::{DeploymentTask, TaskStatus};

/// Shared view of one submitted task. Cloning is cheap; all clones observe
/// the same task, cancellation flag and completion signal.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    task: Arc<Mutex<DeploymentTask>>,
    cancelled: Arc<AtomicBool>,
    finished: watch::Receiver<bool>,
}

/// Worker-side counterpart of a [`TaskHandle`].
pub struct TaskRuntime {
    pub task: Arc<Mutex<DeploymentTask>>,
    pub cancelled: Arc<AtomicBool>,
    finished: watch::Sender<bool>,
}

pub fn task_runtime(task: DeploymentTask) -> (TaskHandle, TaskRuntime) {
    let task_id = task.task_id().to_string();
    let task = Arc::new(Mutex::new(task));
    let cancelled = Arc::new(AtomicBool::new(false));
    let (finished_tx, finished_rx) = watch::channel(false);
    (
        TaskHandle {
            task_id,
            task: task.clone(),
            cancelled: cancelled.clone(),
            finished: finished_rx,
        },
        TaskRuntime {
            task,
            cancelled,
            finished: finished_tx,
        },
    )
}

pub(crate) fn lock_task(task: &Mutex<DeploymentTask>) -> MutexGuard<'_, DeploymentTask> {
    task.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        lock_task(&self.task).status()
    }

    pub fn snapshot(&self) -> DeploymentTask {
        lock_task(&self.task).clone()
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn belongs_to(&self, runtime: &TaskRuntime) -> bool {
        Arc::ptr_eq(&self.cancelled, &runtime.cancelled)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once the worker has left the task, returning the final status.
    pub async fn wait(&self) -> TaskStatus {
        let mut finished = self.finished.clone();
        // A dropped sender also means the worker is gone.
        let _ = finished.wait_for(|done| *done).await;
        self.status()
    }
}

impl TaskRuntime {
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }
}
