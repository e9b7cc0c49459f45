//! Per-server deployment pipeline.
//!
//! `CONNECT -> ENSURE_DIRECTORIES -> BACKUP -> UPLOAD -> EXTRACT -> PLACE_FILES -> CLEANUP -> DONE`.
//! The first failing step ends the run in `FAILED`. Nothing is rolled back.

use std::fmt;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::models::{DeploymentResult, DeploymentTask, ServerTarget};
use crate::progress::{ProgressLevel, ProgressReporter};
use crate::security::redact_text;
use crate::transport::{
    check_remote_directory_exists, create_backup, create_remote_directory, create_session,
    execute_command, upload_file, RemoteSession, Transport,
};
use crate::utils::{
    extraction_dir_name, format_file_size, join_remote_path, parent_remote_dir, shell_quote,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Connect,
    EnsureDirectories,
    Backup,
    Upload,
    Extract,
    PlaceFiles,
    Cleanup,
    Done,
    Failed,
}

impl PipelineStep {
    pub fn label(self) -> &'static str {
        match self {
            PipelineStep::Connect => "CONNECT",
            PipelineStep::EnsureDirectories => "ENSURE_DIRECTORIES",
            PipelineStep::Backup => "BACKUP",
            PipelineStep::Upload => "UPLOAD",
            PipelineStep::Extract => "EXTRACT",
            PipelineStep::PlaceFiles => "PLACE_FILES",
            PipelineStep::Cleanup => "CLEANUP",
            PipelineStep::Done => "DONE",
            PipelineStep::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Picks the format from the file name suffix, case-insensitively.
    /// Unknown suffixes are treated as gzip-compressed tarballs.
    pub fn from_file_name(file_name: &str) -> Self {
        let lower = file_name.to_lowercase();
        if lower.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if lower.ends_with(".tar") {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::TarGz
        }
    }

    pub fn unpack_command(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "unzip -q",
            ArchiveFormat::TarGz => "tar -xzf",
            ArchiveFormat::Tar => "tar -xf",
        }
    }
}

pub fn extraction_command(format: ArchiveFormat, extract_dir: &str, archive_path: &str) -> String {
    let dir = shell_quote(extract_dir);
    format!(
        "mkdir -p {dir} && cd {dir} && {} {}",
        format.unpack_command(),
        shell_quote(archive_path)
    )
}

/// Runs the whole pipeline for one target. Never returns an error: failures
/// are folded into the returned result, and the session is always released.
pub fn deploy_to_server(
    transport: &dyn Transport,
    task: &DeploymentTask,
    target: &ServerTarget,
    reporter: &ProgressReporter,
    connect_timeout: Duration,
) -> DeploymentResult {
    let mut run = PipelineRun {
        target,
        reporter: reporter.for_server(target),
        result: DeploymentResult::start(task.task_id(), target),
        step: PipelineStep::Connect,
    };
    run.log(
        ProgressLevel::Info,
        format!("Starting deployment to {target}"),
    );

    let outcome = target
        .validate_layout()
        .and_then(|()| run.execute(transport, task, connect_timeout));
    match outcome {
        Ok(()) => {
            run.step = PipelineStep::Done;
            run.result.success = true;
            run.log(ProgressLevel::Info, "Deployment completed successfully");
        }
        Err(error) => run.fail(error),
    }
    run.result.finish();
    run.result
}

struct PipelineRun<'a> {
    target: &'a ServerTarget,
    reporter: ProgressReporter,
    result: DeploymentResult,
    step: PipelineStep,
}

impl PipelineRun<'_> {
    fn log(&mut self, level: ProgressLevel, message: impl Into<String>) {
        let message = redact_text(&message.into(), self.reporter.secrets());
        match level {
            ProgressLevel::Debug => self.reporter.debug(message.clone()),
            ProgressLevel::Info => self.reporter.info(message.clone()),
            ProgressLevel::Warn => self.reporter.warn(message.clone()),
            ProgressLevel::Error => self.reporter.error(message.clone()),
        }
        self.result.add_log(message);
    }

    fn enter(&mut self, step: PipelineStep) {
        debug!(server = %self.target.name, step = %step, "Entering pipeline step");
        self.step = step;
    }

    fn fail(&mut self, error: DeployError) {
        let failed_step = self.step;
        self.step = PipelineStep::Failed;
        self.result.fail(&error);
        let message = redact_text(&error.to_string(), self.reporter.secrets());
        self.result.error_message = Some(message.clone());
        self.log(
            ProgressLevel::Error,
            format!("Deployment failed at {failed_step}: {message}"),
        );
    }

    fn execute(
        &mut self,
        transport: &dyn Transport,
        task: &DeploymentTask,
        connect_timeout: Duration,
    ) -> Result<(), DeployError> {
        self.enter(PipelineStep::Connect);
        self.log(
            ProgressLevel::Info,
            format!("Connecting to {}:{}", self.target.host, self.target.port),
        );
        let mut guard = create_session(transport, self.target, connect_timeout)?;
        let session = guard.session();
        self.log(ProgressLevel::Info, "Connected");

        self.enter(PipelineStep::EnsureDirectories);
        self.ensure_directories(session)?;

        if task.create_backup {
            self.enter(PipelineStep::Backup);
            self.backup(session);
        }

        self.enter(PipelineStep::Upload);
        let remote_archive = self.upload(session, task)?;

        self.enter(PipelineStep::Extract);
        let extract_dir = self.extract(session, &task.package_file_name(), &remote_archive)?;

        self.enter(PipelineStep::PlaceFiles);
        self.place_files(session, &extract_dir, &task.files_to_move)?;

        if task.cleanup_after_deployment {
            self.enter(PipelineStep::Cleanup);
            self.log(ProgressLevel::Info, "Removing temporary files");
            let command = format!(
                "rm -rf {} {}",
                shell_quote(&extract_dir),
                shell_quote(&remote_archive)
            );
            self.run(session, &command)?;
        }
        Ok(())
    }

    fn run(&mut self, session: &mut dyn RemoteSession, command: &str) -> Result<String, DeployError> {
        let reporter = &self.reporter;
        execute_command(session, command, &mut |line| reporter.debug(line))
    }

    fn ensure_directories(&mut self, session: &mut dyn RemoteSession) -> Result<(), DeployError> {
        let target = self.target;
        self.log(ProgressLevel::Info, "Checking required directories");
        let directories = [
            target.upload_directory.as_str(),
            target.install_directory.as_str(),
            target.backup_directory.as_str(),
        ];

        for dir in directories {
            if !check_remote_directory_exists(session, dir)? {
                self.log(ProgressLevel::Info, format!("Creating directory {dir}"));
                create_remote_directory(session, dir)?;
            }
        }

        for dir in directories {
            let command = format!("chmod 755 {}", shell_quote(dir));
            if let Err(error) = session.execute(&command, &mut |_| {}) {
                self.log(
                    ProgressLevel::Warn,
                    format!("Warning: cannot set permissions on {dir}: {error}"),
                );
            }
        }
        self.log(ProgressLevel::Info, "Directory permissions updated");
        Ok(())
    }

    fn backup(&mut self, session: &mut dyn RemoteSession) {
        match create_backup(
            session,
            &self.target.install_directory,
            &self.target.backup_directory,
            Local::now(),
            &self.reporter,
        ) {
            Ok(path) => self.result.backup_file_path = path,
            Err(error) => {
                warn!(server = %self.target.name, "Backup failed: {error}");
                self.log(
                    ProgressLevel::Warn,
                    format!("Warning: backup failed, continuing: {error}"),
                );
            }
        }
    }

    fn upload(
        &mut self,
        session: &mut dyn RemoteSession,
        task: &DeploymentTask,
    ) -> Result<String, DeployError> {
        let file_name = task.package_file_name();
        let remote_archive = join_remote_path(&self.target.upload_directory, &file_name);
        let total = std::fs::metadata(&task.local_package_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        self.log(
            ProgressLevel::Info,
            format!(
                "Uploading {file_name} ({}) to {remote_archive}",
                format_file_size(total)
            ),
        );

        let reporter = &self.reporter;
        let sent = upload_file(
            session,
            &task.local_package_path,
            &remote_archive,
            &mut |sent, size| {
                let percent = if size == 0 { 100 } else { sent * 100 / size };
                reporter.info(format!(
                    "Upload progress: {percent}% ({}/{})",
                    format_file_size(sent),
                    format_file_size(size)
                ));
            },
        )?;

        self.result.uploaded_bytes = sent;
        self.log(
            ProgressLevel::Info,
            format!("Upload finished: {}", format_file_size(sent)),
        );
        Ok(remote_archive)
    }

    fn extract(
        &mut self,
        session: &mut dyn RemoteSession,
        file_name: &str,
        remote_archive: &str,
    ) -> Result<String, DeployError> {
        let extract_dir = join_remote_path(
            &self.target.upload_directory,
            &extraction_dir_name(Utc::now()),
        );
        let format = ArchiveFormat::from_file_name(file_name);
        self.log(
            ProgressLevel::Info,
            format!("Extracting {file_name} into {extract_dir}"),
        );

        let command = extraction_command(format, &extract_dir, remote_archive);
        self.run(session, &command).map_err(|error| match error {
            DeployError::CommandExecution { .. } => DeployError::Extraction(error.to_string()),
            other => other,
        })?;
        Ok(extract_dir)
    }

    fn place_files(
        &mut self,
        session: &mut dyn RemoteSession,
        extract_dir: &str,
        files: &[String],
    ) -> Result<(), DeployError> {
        let target = self.target;
        let install_dir = target.install_directory.trim_end_matches('/');
        for relative in files {
            self.log(ProgressLevel::Info, format!("Placing {relative}"));
            let source = join_remote_path(extract_dir, relative);
            let destination = join_remote_path(install_dir, relative);

            if let Some(parent) = parent_remote_dir(&destination) {
                if parent != install_dir {
                    create_remote_directory(session, parent)?;
                }
            }

            let command = format!(
                "cp -r {} {}",
                shell_quote(&source),
                shell_quote(&destination)
            );
            self.run(session, &command)?;
            self.result.add_deployed_file(destination);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{extraction_command, ArchiveFormat, PipelineStep};

    #[test]
    fn archive_format_follows_file_suffix() {
        assert_eq!(ArchiveFormat::from_file_name("app.zip"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_file_name("APP.ZIP"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_file_name("app.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_file_name("app.tgz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_file_name("app.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_file_name("app.bin"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_file_name("app"), ArchiveFormat::TarGz);
    }

    #[test]
    fn extraction_command_creates_and_enters_target_dir() {
        assert_eq!(
            extraction_command(ArchiveFormat::Tar, "/opt/up/extracted_1", "/opt/up/app.tar"),
            "mkdir -p '/opt/up/extracted_1' && cd '/opt/up/extracted_1' && tar -xf '/opt/up/app.tar'"
        );
        assert!(
            extraction_command(ArchiveFormat::Zip, "/x", "/a.zip").contains("unzip -q '/a.zip'")
        );
    }

    #[test]
    fn step_labels_match_state_names() {
        assert_eq!(PipelineStep::EnsureDirectories.to_string(), "ENSURE_DIRECTORIES");
        assert_eq!(PipelineStep::PlaceFiles.label(), "PLACE_FILES");
    }
}
