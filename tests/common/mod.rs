//! Scripted in-process transport for driving the pipeline without SSH.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use remote_deployer::errors::DeployError;
use remote_deployer::models::{DeploymentResult, ServerTarget};
use remote_deployer::task_worker::ResultCallback;
use remote_deployer::{RemoteSession, Transport};

#[derive(Default)]
struct FakeState {
    connects: Vec<String>,
    disconnects: Vec<String>,
    commands: HashMap<String, Vec<String>>,
    uploads: Vec<(String, String, u64)>,
    unreachable_hosts: HashSet<String>,
    failing_commands: Vec<String>,
    empty_dirs: HashSet<String>,
    missing_dirs: HashSet<String>,
    backup_missing: bool,
}

/// Holds every connecting worker until released.
#[derive(Default)]
pub struct Gate {
    state: Mutex<(usize, bool)>,
    changed: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 += 1;
        self.changed.notify_all();
        while !state.1 {
            state = self.changed.wait(state).unwrap();
        }
    }

    pub fn entered(&self) -> usize {
        self.state.lock().unwrap().0
    }

    pub fn release(&self) {
        self.state.lock().unwrap().1 = true;
        self.changed.notify_all();
    }

    pub async fn wait_entered(&self, count: usize) {
        for _ in 0..500 {
            if self.entered() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} worker(s) reached the gate, expected {count}", self.entered());
    }
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    gate: Option<Arc<Gate>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn unreachable(self, host: &str) -> Self {
        self.state.lock().unwrap().unreachable_hosts.insert(host.to_string());
        self
    }

    /// Any command containing `fragment` exits with status 1.
    pub fn failing(self, fragment: &str) -> Self {
        self.state.lock().unwrap().failing_commands.push(fragment.to_string());
        self
    }

    pub fn empty_dir(self, dir: &str) -> Self {
        self.state.lock().unwrap().empty_dirs.insert(dir.to_string());
        self
    }

    pub fn missing_dir(self, dir: &str) -> Self {
        self.state.lock().unwrap().missing_dirs.insert(dir.to_string());
        self
    }

    /// The archive never shows up after `tar -czf`.
    pub fn backup_missing(self) -> Self {
        self.state.lock().unwrap().backup_missing = true;
        self
    }

    pub fn commands_for(&self, server: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.state.lock().unwrap().disconnects.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, u64)> {
        self.state.lock().unwrap().uploads.clone()
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        target: &ServerTarget,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        let mut state = self.state.lock().unwrap();
        state.connects.push(target.name.clone());
        if state.unreachable_hosts.contains(&target.host) {
            return Err(DeployError::Connection(format!(
                "Failed to establish TCP connection to `{}:{}`: connection refused",
                target.host, target.port
            )));
        }
        Ok(Box::new(FakeSession {
            server: target.name.clone(),
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    server: String,
    state: Arc<Mutex<FakeState>>,
}

fn mentions(command: &str, dirs: &HashSet<String>) -> bool {
    dirs.iter().any(|dir| command.contains(&format!("'{dir}'")))
}

impl RemoteSession for FakeSession {
    fn execute(
        &mut self,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<String, DeployError> {
        let output = {
            let mut state = self.state.lock().unwrap();
            state
                .commands
                .entry(self.server.clone())
                .or_default()
                .push(command.to_string());

            if state
                .failing_commands
                .iter()
                .any(|fragment| command.contains(fragment.as_str()))
            {
                return Err(DeployError::CommandExecution {
                    command: command.to_string(),
                    exit_code: 1,
                });
            }

            if command.contains("echo 'EXISTS'") {
                if mentions(command, &state.missing_dirs) {
                    "NOT_EXISTS\n"
                } else {
                    "EXISTS\n"
                }
            } else if command.contains("HAS_CONTENT") {
                if mentions(command, &state.empty_dirs) {
                    "EMPTY_OR_NOT_EXISTS\n"
                } else {
                    "HAS_CONTENT\n"
                }
            } else if command.contains("BACKUP_EXISTS") {
                if state.backup_missing {
                    "BACKUP_FAILED\n"
                } else {
                    "BACKUP_EXISTS\n"
                }
            } else {
                ""
            }
        };

        for line in output.lines() {
            on_output(line);
        }
        Ok(output.to_string())
    }

    fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<u64, DeployError> {
        let size = std::fs::metadata(local_path)
            .map_err(|error| DeployError::Transfer(error.to_string()))?
            .len();
        on_chunk(size);
        self.state.lock().unwrap().uploads.push((
            self.server.clone(),
            remote_path.to_string(),
            size,
        ));
        Ok(size)
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnects.push(self.server.clone());
    }
}

pub fn target(name: &str, host: &str) -> ServerTarget {
    ServerTarget {
        password: Some("s3cr3t-pass".to_string()),
        upload_directory: "/opt/upload".to_string(),
        install_directory: "/opt/app".to_string(),
        backup_directory: "/opt/backup".to_string(),
        ..ServerTarget::new(name, host, "deploy")
    }
}

pub fn package(dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, vec![7u8; 4096]).unwrap();
    path
}

pub fn collector() -> (ResultCallback, Arc<Mutex<Vec<DeploymentResult>>>) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let callback: ResultCallback =
        Box::new(move |result: DeploymentResult| sink.lock().unwrap().push(result));
    (callback, results)
}
