//! Error types for remote deployments

use thiserror::Error;

/// Failure raised by the transport, pipeline, store or configuration layers.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Command `{command}` failed with exit code {exit_code}")]
    CommandExecution { command: String, exit_code: i32 },

    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Short machine-readable code, stored alongside history records.
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Authentication(_) => "AUTHENTICATION",
            DeployError::Connection(_) => "CONNECTION",
            DeployError::Directory(_) => "DIRECTORY",
            DeployError::Transfer(_) => "TRANSFER",
            DeployError::Extraction(_) => "EXTRACTION",
            DeployError::CommandExecution { .. } => "COMMAND_EXECUTION",
            DeployError::Timeout { .. } => "TIMEOUT",
            DeployError::Validation(_) => "VALIDATION",
            DeployError::Storage(_) => "STORAGE",
            DeployError::Config(_) => "CONFIG",
            DeployError::Io(_) => "IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DeployError;

    #[test]
    fn command_execution_message_names_command_and_exit_code() {
        let error = DeployError::CommandExecution {
            command: "tar -xzf app.tgz".to_string(),
            exit_code: 2,
        };
        assert_eq!(
            error.to_string(),
            "Command `tar -xzf app.tgz` failed with exit code 2"
        );
        assert_eq!(error.code(), "COMMAND_EXECUTION");
    }
}
