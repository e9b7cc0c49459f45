mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use remote_deployer::models::{DeploymentTask, ServerTarget};
use remote_deployer::pipeline::deploy_to_server;
use remote_deployer::progress::{NullSink, ProgressEvent, ProgressLevel, ProgressReporter};

use common::{package, target, FakeTransport};

const TIMEOUT: Duration = Duration::from_secs(5);

fn task_for(package: std::path::PathBuf, targets: Vec<ServerTarget>, files: &[&str]) -> DeploymentTask {
    let mut task = DeploymentTask::new(package, targets);
    task.task_id = Some("task-1".to_string());
    task.files_to_move = files.iter().map(|file| file.to_string()).collect();
    task
}

fn quiet_reporter() -> ProgressReporter {
    ProgressReporter::new("task-1", Arc::new(NullSink), None)
}

#[test]
fn zip_deployment_with_backup_places_files_on_every_server() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let servers = vec![target("web-1", "10.0.0.1"), target("web-2", "10.0.0.2")];
    let task = task_for(package(dir.path(), "app.zip"), servers.clone(), &["app.jar"]);
    let backup_name = Regex::new(r"^/opt/backup/backup_\d{12}\.tar\.gz$").unwrap();

    for server in &servers {
        let result = deploy_to_server(&transport, &task, server, &quiet_reporter(), TIMEOUT);
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.server.name, server.name);
        assert_eq!(result.deployed_files, vec!["/opt/app/app.jar"]);
        assert_eq!(result.uploaded_bytes, 4096);
        let backup = result.backup_file_path.expect("backup path");
        assert!(backup_name.is_match(&backup), "{backup}");
        assert!(result.ended_at.is_some());
    }

    let commands = transport.commands_for("web-1");
    let extract = commands
        .iter()
        .find(|command| command.contains("unzip -q"))
        .expect("extraction command");
    assert!(extract.contains("'/opt/upload/app.zip'"));
    assert!(extract.contains("/opt/upload/extracted_"));
    assert!(commands.iter().any(|command| command.starts_with("cp -r ")
        && command.ends_with("'/opt/app/app.jar'")));
    assert!(commands.iter().any(|command| command.starts_with("rm -rf ")));
    assert_eq!(
        transport.uploads()[0],
        ("web-1".to_string(), "/opt/upload/app.zip".to_string(), 4096)
    );
    assert_eq!(transport.disconnects(), vec!["web-1", "web-2"]);
}

#[test]
fn empty_install_directory_skips_backup_but_still_deploys() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().empty_dir("/opt/app");
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &["app.jar"]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.backup_file_path, None);
    let commands = transport.commands_for("web-1");
    assert!(!commands.iter().any(|command| command.contains("tar -czf")));
    assert!(commands.iter().any(|command| command.contains("tar -xzf") || command.contains("unzip")));
    assert_eq!(result.deployed_files, vec!["/opt/app/app.jar"]);
}

#[test]
fn plain_tar_package_is_extracted_without_gzip() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.tar"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(result.success);
    let extract = transport
        .commands_for("web-1")
        .into_iter()
        .find(|command| command.contains("cd '/opt/upload/extracted_"))
        .expect("extraction command");
    assert!(extract.contains("tar -xf '/opt/upload/app.tar'"));
    assert!(!extract.contains("tar -xzf"));
}

#[test]
fn nested_paths_get_their_parent_directory_created() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let server = target("web-1", "10.0.0.1");
    let task = task_for(
        package(dir.path(), "app.tgz"),
        vec![server.clone()],
        &["app.jar", "config/application.yml"],
    );

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(result.success);
    assert_eq!(
        result.deployed_files,
        vec!["/opt/app/app.jar", "/opt/app/config/application.yml"]
    );
    let mkdirs = transport
        .commands_for("web-1")
        .into_iter()
        .filter(|command| command.starts_with("mkdir -p '/opt/app"))
        .collect::<Vec<_>>();
    assert_eq!(mkdirs, vec!["mkdir -p '/opt/app/config'"]);
}

#[test]
fn missing_directories_are_created_before_use() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().missing_dir("/opt/backup");
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(result.success);
    let commands = transport.commands_for("web-1");
    assert!(commands.contains(&"mkdir -p '/opt/backup'".to_string()));
    assert!(!commands.contains(&"mkdir -p '/opt/app'".to_string()));
}

#[test]
fn chmod_failures_are_warnings_only() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().failing("chmod 755");
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &["app.jar"]);

    let events = Arc::new(Mutex::new(Vec::<ProgressEvent>::new()));
    let sink = {
        let events = events.clone();
        move |event: ProgressEvent| events.lock().unwrap().push(event)
    };
    let reporter = ProgressReporter::new("task-1", Arc::new(sink), None);

    let result = deploy_to_server(&transport, &task, &server, &reporter, TIMEOUT);

    assert!(result.success);
    let warnings = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.level == ProgressLevel::Warn)
        .count();
    assert_eq!(warnings, 3);
    assert!(result
        .log_messages
        .iter()
        .any(|line| line.message.starts_with("Warning: cannot set permissions")));
}

#[test]
fn unverified_backup_is_a_warning_and_deployment_continues() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().backup_missing();
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &["app.jar"]);

    let events = Arc::new(Mutex::new(Vec::<ProgressEvent>::new()));
    let sink = {
        let events = events.clone();
        move |event: ProgressEvent| events.lock().unwrap().push(event)
    };
    let reporter = ProgressReporter::new("task-1", Arc::new(sink), None);

    let result = deploy_to_server(&transport, &task, &server, &reporter, TIMEOUT);

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.backup_file_path, None);
    assert_eq!(result.deployed_files, vec!["/opt/app/app.jar"]);
    assert!(transport
        .commands_for("web-1")
        .iter()
        .any(|command| command.contains("tar -czf")));
    assert!(events.lock().unwrap().iter().any(|event| {
        event.level == ProgressLevel::Warn && event.message.contains("backup archive was not created")
    }));
}

#[test]
fn keeping_temporary_files_skips_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let server = target("web-1", "10.0.0.1");
    let mut task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &["app.jar"]);
    task.cleanup_after_deployment = false;

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(result.success);
    assert!(!transport
        .commands_for("web-1")
        .iter()
        .any(|command| command.starts_with("rm -rf")));
    assert!(result
        .log_messages
        .iter()
        .all(|line| line.message != "Removing temporary files"));
}

#[test]
fn failed_extraction_stops_the_pipeline_without_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().failing("unzip -q");
    let server = target("web-1", "10.0.0.1");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &["app.jar"]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("EXTRACTION"));
    assert!(result.deployed_files.is_empty());
    assert!(result.backup_file_path.is_some());
    let commands = transport.commands_for("web-1");
    assert!(!commands.iter().any(|command| command.starts_with("rm -rf")));
    assert!(!commands.iter().any(|command| command.starts_with("cp -r")));
    assert_eq!(transport.disconnects(), vec!["web-1"]);
    assert!(result
        .log_messages
        .last()
        .is_some_and(|line| line.message.starts_with("Deployment failed at EXTRACT")));
}

#[test]
fn unreachable_server_fails_with_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().unreachable("10.0.0.9");
    let server = target("db-1", "10.0.0.9");
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("CONNECTION"));
    assert!(!result.error_message.unwrap_or_default().is_empty());
    assert!(transport.disconnects().is_empty());
}

#[test]
fn target_without_credentials_fails_authentication_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let mut server = target("web-1", "10.0.0.1");
    server.password = None;
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("AUTHENTICATION"));
    assert!(transport.connects().is_empty());
    assert!(result
        .log_messages
        .last()
        .is_some_and(|line| line.message.starts_with("Deployment failed at CONNECT")));
}

#[test]
fn target_with_empty_install_directory_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let mut server = target("web-1", "10.0.0.1");
    server.install_directory = "  ".to_string();
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("VALIDATION"));
    assert!(transport.connects().is_empty());
}

#[test]
fn secrets_never_reach_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new().failing("s3cr3t-pass");
    let mut server = target("web-1", "10.0.0.1");
    server.install_directory = "/opt/s3cr3t-pass".to_string();
    let task = task_for(package(dir.path(), "app.zip"), vec![server.clone()], &[]);

    let result = deploy_to_server(&transport, &task, &server, &quiet_reporter(), TIMEOUT);

    assert!(!result.success);
    let message = result.error_message.unwrap();
    assert!(!message.contains("s3cr3t-pass"), "{message}");
    assert!(result
        .log_messages
        .iter()
        .all(|line| !line.message.contains("s3cr3t-pass")));
}
