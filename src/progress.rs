//! Progress delivery from pipeline steps to observers.
//!
//! Every message produced by a deployment goes through a [`ProgressReporter`],
//! which mirrors it to `tracing`, to the per-task [`AuditLog`] file and to the
//! caller's [`ProgressSink`]. Sinks run synchronously on the worker thread that
//! produced the message; [`progress_channel`] puts a bounded buffer with an
//! explicit overflow policy between the worker and the consumer.

use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audit_log::AuditLog;
use crate::models::ServerTarget;
use crate::security::redact_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ProgressLevel {
    pub fn label(self) -> &'static str {
        match self {
            ProgressLevel::Debug => "DEBUG",
            ProgressLevel::Info => "INFO",
            ProgressLevel::Warn => "WARN",
            ProgressLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    pub server: Option<String>,
    pub level: ProgressLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "[{server}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Receives progress events. Implementations must not assume a particular thread.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The producing worker waits until the consumer frees a slot.
    #[default]
    Block,
    /// The oldest buffered event is discarded to make room.
    DropOldest,
}

enum SinkInner {
    Block(std_mpsc::SyncSender<ProgressEvent>),
    DropOldest(broadcast::Sender<ProgressEvent>),
}

pub struct ChannelSink {
    inner: SinkInner,
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A consumer that went away must never fail the deployment.
        match &self.inner {
            SinkInner::Block(tx) => {
                let _ = tx.send(event);
            }
            SinkInner::DropOldest(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

enum ReceiverInner {
    Block(std_mpsc::Receiver<ProgressEvent>),
    DropOldest(broadcast::Receiver<ProgressEvent>),
}

/// Consuming end of [`progress_channel`]. `recv` blocks the calling thread,
/// so drive it from a plain thread or `spawn_blocking`, not from async code.
pub struct ProgressReceiver {
    inner: ReceiverInner,
    dropped: u64,
}

impl ProgressReceiver {
    /// Next event, or `None` once every sink has been dropped and the buffer is drained.
    pub fn recv(&mut self) -> Option<ProgressEvent> {
        match &mut self.inner {
            ReceiverInner::Block(rx) => rx.recv().ok(),
            ReceiverInner::DropOldest(rx) => loop {
                match rx.blocking_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => self.dropped += skipped,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        match &mut self.inner {
            ReceiverInner::Block(rx) => rx.try_recv().ok(),
            ReceiverInner::DropOldest(rx) => loop {
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        self.dropped += skipped
                    }
                    Err(_) => return None,
                }
            },
        }
    }

    /// Events discarded by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Bounded progress channel with an explicit overflow policy.
pub fn progress_channel(capacity: usize, policy: OverflowPolicy) -> (ChannelSink, ProgressReceiver) {
    let capacity = capacity.max(1);
    match policy {
        OverflowPolicy::Block => {
            let (tx, rx) = std_mpsc::sync_channel(capacity);
            (
                ChannelSink {
                    inner: SinkInner::Block(tx),
                },
                ProgressReceiver {
                    inner: ReceiverInner::Block(rx),
                    dropped: 0,
                },
            )
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (
                ChannelSink {
                    inner: SinkInner::DropOldest(tx),
                },
                ProgressReceiver {
                    inner: ReceiverInner::DropOldest(rx),
                    dropped: 0,
                },
            )
        }
    }
}

/// Fans one message out to tracing, the audit log and the caller's sink.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    server: Option<String>,
    secrets: Vec<String>,
    sink: Arc<dyn ProgressSink>,
    audit: Option<Arc<AuditLog>>,
}

impl ProgressReporter {
    pub fn new(task_id: &str, sink: Arc<dyn ProgressSink>, audit: Option<Arc<AuditLog>>) -> Self {
        Self {
            task_id: task_id.to_string(),
            server: None,
            secrets: Vec::new(),
            sink,
            audit,
        }
    }

    pub fn for_server(&self, server: &ServerTarget) -> Self {
        Self {
            server: Some(server.name.clone()),
            secrets: server.to_secret_list(),
            ..self.clone()
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Error, message.into());
    }

    fn emit(&self, level: ProgressLevel, message: String) {
        let message = redact_text(&message, &self.secrets);
        let server = self.server.as_deref().unwrap_or("-");
        match level {
            ProgressLevel::Debug => debug!(task_id = %self.task_id, server, "{message}"),
            ProgressLevel::Info => info!(task_id = %self.task_id, server, "{message}"),
            ProgressLevel::Warn => warn!(task_id = %self.task_id, server, "{message}"),
            ProgressLevel::Error => error!(task_id = %self.task_id, server, "{message}"),
        }

        let event = ProgressEvent {
            task_id: self.task_id.clone(),
            server: self.server.clone(),
            level,
            message,
            timestamp: Utc::now(),
        };
        if let Some(audit) = &self.audit {
            audit.append(&self.task_id, level, &event.to_string());
        }
        self.sink.emit(event);
    }
}
