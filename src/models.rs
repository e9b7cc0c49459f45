use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_true() -> bool {
    true
}

/// Remote host definition that deployments are pushed to. `name` is the unique key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerTarget {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Accepted on input, never written out.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key_passphrase: Option<String>,
    pub upload_directory: String,
    pub install_directory: String,
    pub backup_directory: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Credential selected for a session. A private key wins over a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential<'a> {
    PrivateKey {
        path: &'a str,
        passphrase: Option<&'a str>,
    },
    Password(&'a str),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl ServerTarget {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            upload_directory: String::new(),
            install_directory: String::new(),
            backup_directory: String::new(),
            enabled: true,
            description: None,
        }
    }

    pub fn credential(&self) -> Option<Credential<'_>> {
        if let Some(path) = non_blank(&self.private_key_path) {
            return Some(Credential::PrivateKey {
                path,
                passphrase: non_blank(&self.private_key_passphrase),
            });
        }
        non_blank(&self.password).map(Credential::Password)
    }

    /// Checks the address and directory fields and names the first one missing.
    /// Credentials are left to session creation.
    pub fn validate_layout(&self) -> Result<(), DeployError> {
        let required = [
            ("name", &self.name),
            ("host", &self.host),
            ("username", &self.username),
            ("upload directory", &self.upload_directory),
            ("install directory", &self.install_directory),
            ("backup directory", &self.backup_directory),
        ];
        for (label, value) in required {
            if value.trim().is_empty() {
                return Err(DeployError::Validation(format!(
                    "Server `{}` has an empty {label}",
                    self.name
                )));
            }
        }
        if self.port == 0 {
            return Err(DeployError::Validation(format!(
                "Server `{}` port must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Layout check plus a usable credential; gates what the store accepts.
    pub fn validate(&self) -> Result<(), DeployError> {
        self.validate_layout()?;
        if self.credential().is_none() {
            return Err(DeployError::Validation(format!(
                "Server `{}` needs a password or a private key path",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Secret values that must never reach logs or history.
    pub fn to_secret_list(&self) -> Vec<String> {
        let mut values = Vec::new();
        if let Some(value) = non_blank(&self.password) {
            values.push(value.to_string());
        }
        if let Some(value) = non_blank(&self.private_key_passphrase) {
            values.push(value.to_string());
        }
        values
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Status only moves forward: PENDING -> RUNNING -> one terminal state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Failed | TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One deployment request: one artifact pushed to one or more targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTask {
    pub task_id: Option<String>,
    pub local_package_path: PathBuf,
    pub target_servers: Vec<ServerTarget>,
    pub files_to_move: Vec<String>,
    status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub description: String,
    pub create_backup: bool,
    pub cleanup_after_deployment: bool,
}

impl DeploymentTask {
    pub fn new(local_package_path: impl Into<PathBuf>, target_servers: Vec<ServerTarget>) -> Self {
        Self {
            task_id: None,
            local_package_path: local_package_path.into(),
            target_servers,
            files_to_move: Vec::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            description: String::new(),
            create_backup: true,
            cleanup_after_deployment: true,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Moves the task forward; a regressing transition is ignored and reported as `false`.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn task_id(&self) -> &str {
        self.task_id.as_deref().unwrap_or_default()
    }

    /// Archive file name as it will appear in the remote upload directory.
    pub fn package_file_name(&self) -> String {
        self.local_package_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn enabled_targets(&self) -> impl Iterator<Item = &ServerTarget> {
        self.target_servers.iter().filter(|target| target.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.timestamp.to_rfc3339(), self.message)
    }
}

/// Outcome of running the pipeline against one target for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub task_id: String,
    pub server: ServerTarget,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub log_messages: Vec<LogLine>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub uploaded_bytes: u64,
    pub backup_file_path: Option<String>,
    pub deployed_files: Vec<String>,
}

impl DeploymentResult {
    pub fn start(task_id: &str, server: &ServerTarget) -> Self {
        Self {
            task_id: task_id.to_string(),
            server: server.clone(),
            success: false,
            error_code: None,
            error_message: None,
            log_messages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            uploaded_bytes: 0,
            backup_file_path: None,
            deployed_files: Vec::new(),
        }
    }

    pub fn add_log(&mut self, message: impl Into<String>) {
        self.log_messages.push(LogLine {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    pub fn add_deployed_file(&mut self, path: impl Into<String>) {
        self.deployed_files.push(path.into());
    }

    pub fn fail(&mut self, error: &DeployError) {
        self.success = false;
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_millis(&self) -> i64 {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

/// Durable audit row written for every finished per-server result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentHistoryRecord {
    pub id: Option<i64>,
    pub task_id: String,
    pub server_name: String,
    pub server_host: String,
    pub package_name: String,
    pub package_size: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_millis: i64,
    pub backup_file_path: Option<String>,
    pub deployed_files: Vec<String>,
    pub task_description: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{Credential, DeploymentResult, DeploymentTask, ServerTarget, TaskStatus};

    fn target() -> ServerTarget {
        ServerTarget {
            upload_directory: "/opt/upload".to_string(),
            install_directory: "/opt/app".to_string(),
            backup_directory: "/opt/backup".to_string(),
            password: Some("secret".to_string()),
            ..ServerTarget::new("web-1", "10.0.0.5", "deploy")
        }
    }

    #[test]
    fn target_requires_a_credential_and_all_directories() {
        assert!(target().is_valid());

        let mut no_auth = target();
        no_auth.password = Some("   ".to_string());
        assert!(!no_auth.is_valid());
        assert!(no_auth.validate_layout().is_ok());

        let mut no_backup = target();
        no_backup.backup_directory.clear();
        let error = no_backup.validate().unwrap_err().to_string();
        assert!(error.contains("backup directory"));
    }

    #[test]
    fn private_key_takes_precedence_over_password() {
        let mut server = target();
        server.private_key_path = Some("/home/deploy/.ssh/id_ed25519".to_string());
        assert_eq!(
            server.credential(),
            Some(Credential::PrivateKey {
                path: "/home/deploy/.ssh/id_ed25519",
                passphrase: None,
            })
        );
    }

    #[test]
    fn serialized_results_carry_no_credentials() {
        let mut server = target();
        server.private_key_passphrase = Some("key-phrase".to_string());
        let json = serde_json::to_string(&DeploymentResult::start("t-1", &server)).unwrap();
        assert!(!json.contains("secret"), "{json}");
        assert!(!json.contains("key-phrase"), "{json}");
        assert!(json.contains("\"host\":\"10.0.0.5\""));

        let parsed: ServerTarget = serde_json::from_str(
            r#"{"name":"a","host":"h","username":"u","password":"pw",
                "uploadDirectory":"/u","installDirectory":"/i","backupDirectory":"/b"}"#,
        )
        .unwrap();
        assert_eq!(parsed.password.as_deref(), Some("pw"));
    }

    #[test]
    fn task_status_never_regresses() {
        let mut task = DeploymentTask::new("/tmp/app.zip", vec![target()]);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.advance(TaskStatus::Running));
        assert!(task.started_at.is_some());
        assert!(!task.advance(TaskStatus::Pending));
        assert!(task.advance(TaskStatus::Completed));
        assert!(!task.advance(TaskStatus::Running));
        assert!(!task.advance(TaskStatus::Cancelled));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn disabled_targets_are_not_enabled_targets() {
        let mut second = target();
        second.name = "web-2".to_string();
        second.enabled = false;
        let task = DeploymentTask::new("/tmp/app.zip", vec![target(), second]);
        let names = task
            .enabled_targets()
            .map(|server| server.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["web-1"]);
        assert_eq!(task.package_file_name(), "app.zip");
    }
}
