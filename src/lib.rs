//! Pushes a build artifact to a set of remote hosts over SSH: backup,
//! upload, extraction and file placement per host, with per-host results,
//! live progress and a durable audit trail.

pub mod audit_log;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod recorder;
pub mod security;
pub mod service;
pub mod ssh_client;
pub mod state;
pub mod task_worker;
pub mod transport;
pub mod utils;

pub use config::DeployerConfig;
pub use errors::DeployError;
pub use models::{
    DeploymentHistoryRecord, DeploymentResult, DeploymentTask, ServerTarget, TaskStatus,
};
pub use progress::{progress_channel, OverflowPolicy, ProgressEvent, ProgressSink};
pub use service::DeploymentService;
pub use ssh_client::SshTransport;
pub use state::TaskHandle;
pub use task_worker::DeploymentScheduler;
pub use transport::{RemoteSession, Transport};
