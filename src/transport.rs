//! Remote session abstraction and the shell-level operations built on it.
//!
//! [`Transport`] opens authenticated sessions; [`RemoteSession`] executes
//! commands and streams files. Everything else here (directories, backups,
//! throttled uploads) is expressed as commands over a session, so it behaves
//! the same against the SSH backend and any other implementation.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::errors::DeployError;
use crate::models::ServerTarget;
use crate::progress::ProgressReporter;
use crate::utils::{backup_file_name, join_remote_path, parent_remote_dir, shell_quote};

/// Hard ceiling for a single remote command. Not configurable.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const TEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait RemoteSession: Send {
    /// Runs `command` and returns its combined output. Each output line is
    /// passed to `on_output` as it arrives, stderr lines prefixed `ERROR: `.
    /// A non-zero exit status is `CommandExecution`, exceeding
    /// [`COMMAND_TIMEOUT`] is `Timeout`.
    fn execute(
        &mut self,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<String, DeployError>;

    /// Streams a local file to `remote_path`, reporting the cumulative byte
    /// count after every chunk. The parent directory must already exist.
    fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<u64, DeployError>;

    fn disconnect(&mut self);
}

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        target: &ServerTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError>;
}

/// An open session that is disconnected when dropped, on every exit path.
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
}

impl SessionGuard {
    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.disconnect();
    }
}

/// Opens an authenticated session. Host keys are not verified.
pub fn create_session(
    transport: &dyn Transport,
    target: &ServerTarget,
    timeout: Duration,
) -> Result<SessionGuard, DeployError> {
    if target.credential().is_none() {
        return Err(DeployError::Authentication(format!(
            "Server `{}` has neither a private key nor a password",
            target.name
        )));
    }
    let session = transport.connect(target, timeout)?;
    Ok(SessionGuard { session })
}

pub fn execute_command(
    session: &mut dyn RemoteSession,
    command: &str,
    on_output: &mut dyn FnMut(&str),
) -> Result<String, DeployError> {
    session.execute(command, on_output)
}

fn execute_quiet(session: &mut dyn RemoteSession, command: &str) -> Result<String, DeployError> {
    session.execute(command, &mut |_| {})
}

fn output_has_marker(output: &str, marker: &str) -> bool {
    output.lines().any(|line| line.trim() == marker)
}

/// `mkdir -p`; safe to call repeatedly.
pub fn create_remote_directory(
    session: &mut dyn RemoteSession,
    remote_dir: &str,
) -> Result<(), DeployError> {
    execute_quiet(session, &format!("mkdir -p {}", shell_quote(remote_dir)))
        .map(|_| ())
        .map_err(|error| {
            DeployError::Directory(format!("Failed to create `{remote_dir}`: {error}"))
        })
}

pub fn check_remote_directory_exists(
    session: &mut dyn RemoteSession,
    remote_dir: &str,
) -> Result<bool, DeployError> {
    let output = execute_quiet(
        session,
        &format!(
            "test -d {} && echo 'EXISTS' || echo 'NOT_EXISTS'",
            shell_quote(remote_dir)
        ),
    )
    .map_err(|error| DeployError::Directory(format!("Failed to check `{remote_dir}`: {error}")))?;
    Ok(output_has_marker(&output, "EXISTS"))
}

/// Ensures the parent directory exists, then transfers the file.
/// `on_progress` receives `(bytes_transferred, total_bytes)` at most once per
/// [`UPLOAD_PROGRESS_INTERVAL`].
pub fn upload_file(
    session: &mut dyn RemoteSession,
    local_path: &Path,
    remote_path: &str,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, DeployError> {
    let total = std::fs::metadata(local_path)
        .map_err(|error| {
            DeployError::Transfer(format!(
                "Cannot read local package `{}`: {error}",
                local_path.display()
            ))
        })?
        .len();

    if let Some(parent) = parent_remote_dir(remote_path) {
        create_remote_directory(session, parent)?;
    }

    let mut throttle = ProgressThrottle::new(UPLOAD_PROGRESS_INTERVAL);
    session.upload(local_path, remote_path, &mut |sent| {
        if throttle.ready(Instant::now()) {
            on_progress(sent, total);
        }
    })
}

/// Archives a non-empty `source_dir` into `backup_dir`.
///
/// Returns `None` without error when the source is missing or empty, or when
/// the archive cannot be found after `tar` ran.
pub fn create_backup(
    session: &mut dyn RemoteSession,
    source_dir: &str,
    backup_dir: &str,
    now: DateTime<Local>,
    reporter: &ProgressReporter,
) -> Result<Option<String>, DeployError> {
    let backup_path = join_remote_path(backup_dir, &backup_file_name(now));
    reporter.info(format!("Creating backup: {backup_path}"));

    create_remote_directory(session, backup_dir)?;

    let source = shell_quote(source_dir);
    let check = execute_quiet(
        session,
        &format!(
            "test -d {source} && [ \"$(ls -A {source} 2>/dev/null)\" ] && echo 'HAS_CONTENT' || echo 'EMPTY_OR_NOT_EXISTS'"
        ),
    )?;
    if !output_has_marker(&check, "HAS_CONTENT") {
        reporter.info(format!(
            "Source directory is empty or missing, skipping backup: {source_dir}"
        ));
        return Ok(None);
    }

    let archive = shell_quote(&backup_path);
    session.execute(
        &format!(
            "cd {source} && tar -czf {archive} . 2>/dev/null || echo 'Backup completed with warnings'"
        ),
        &mut |line| reporter.debug(line),
    )?;

    let verify = execute_quiet(
        session,
        &format!("test -f {archive} && echo 'BACKUP_EXISTS' || echo 'BACKUP_FAILED'"),
    )?;
    if output_has_marker(&verify, "BACKUP_EXISTS") {
        reporter.info(format!("Backup created: {backup_path}"));
        Ok(Some(backup_path))
    } else {
        reporter.warn("Warning: backup archive was not created");
        Ok(None)
    }
}

/// Lets an event through at most once per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// The first call only arms the timer; reporting starts one interval in.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            None => {
                self.last = Some(now);
                false
            }
            Some(last) if now.duration_since(last) >= self.interval => {
                self.last = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{output_has_marker, ProgressThrottle};

    #[test]
    fn marker_match_is_exact_per_line() {
        assert!(output_has_marker("EXISTS\n", "EXISTS"));
        assert!(!output_has_marker("NOT_EXISTS\n", "EXISTS"));
        assert!(output_has_marker("warning\n  HAS_CONTENT  \n", "HAS_CONTENT"));
    }

    #[test]
    fn throttle_reports_at_most_once_per_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(!throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(400)));
        assert!(throttle.ready(start + Duration::from_millis(1000)));
        assert!(!throttle.ready(start + Duration::from_millis(1900)));
        assert!(throttle.ready(start + Duration::from_millis(2100)));
    }
}
