//! Append-only per-task audit files: `deployment_<taskId>_<yyyyMMdd>.log`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

use crate::progress::ProgressLevel;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn file_path(&self, task_id: &str, day: DateTime<Local>) -> PathBuf {
        self.dir
            .join(format!("deployment_{task_id}_{}.log", day.format("%Y%m%d")))
    }

    /// Appends one line; failures are logged and swallowed.
    pub fn append(&self, task_id: &str, level: ProgressLevel, message: &str) {
        let now = Local::now();
        let line = format!(
            "[{}] [{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            level.label(),
            message
        );
        let path = self.file_path(task_id, now);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            error!(path = %path.display(), "Failed to write deployment audit log: {err}");
        }
    }

    /// Today's log content for a task, empty when nothing was written.
    pub fn read(&self, task_id: &str) -> String {
        let path = self.file_path(task_id, Local::now());
        if !path.exists() {
            return String::new();
        }
        fs::read_to_string(&path).unwrap_or_else(|err| {
            error!(path = %path.display(), "Failed to read deployment audit log: {err}");
            String::new()
        })
    }

    /// Removes `.log` files whose modification time is older than `retention_days`.
    pub fn cleanup_older_than(&self, retention_days: u32) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.cleanup_modified_before(cutoff)
    }

    pub fn cleanup_modified_before(&self, cutoff: SystemTime) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(err) => {
                error!(dir = %self.dir.display(), "Failed to list audit log directory: {err}");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Removed expired audit log");
                    removed += 1;
                }
                Err(err) => warn!(path = %path.display(), "Failed to remove audit log: {err}"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use chrono::{Local, TimeZone};

    use super::AuditLog;
    use crate::progress::ProgressLevel;

    #[test]
    fn file_name_is_keyed_by_task_and_day() {
        let log = AuditLog::new("/var/log/deployer");
        let day = Local.with_ymd_and_hms(2024, 1, 31, 23, 59, 0).unwrap();
        assert_eq!(
            log.file_path("abc", day).file_name().unwrap().to_string_lossy(),
            "deployment_abc_20240131.log"
        );
    }

    #[test]
    fn append_then_read_returns_formatted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("t1", ProgressLevel::Info, "started");
        log.append("t1", ProgressLevel::Warn, "chmod failed");

        let content = log.read("t1");
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] started"));
        assert!(lines[1].ends_with("[WARN] chmod failed"));
        assert!(log.read("other").is_empty());
    }

    #[test]
    fn cleanup_removes_only_expired_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("t1", ProgressLevel::Info, "kept");
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(log.cleanup_older_than(30), 0);

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(log.cleanup_modified_before(future), 1);
        assert!(dir.path().join("notes.txt").exists());
    }
}
