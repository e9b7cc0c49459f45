use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{Channel, Session};
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::models::{Credential, ServerTarget};
use crate::transport::{RemoteSession, Transport, COMMAND_POLL_INTERVAL, COMMAND_TIMEOUT};
use crate::utils::truncate_for_log;

/// Socket-level timeout for blocking SFTP and channel bookkeeping calls.
pub const SOCKET_IO_TIMEOUT_SECONDS: u64 = 120;
const UPLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// [`Transport`] backed by libssh2.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshTransport;

impl Transport for SshTransport {
    fn connect(
        &self,
        target: &ServerTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        Ok(Box::new(connect_ssh(target, timeout)?))
    }
}

pub struct SshSession {
    session: Session,
    label: String,
}

pub fn connect_ssh(target: &ServerTarget, timeout: Duration) -> Result<SshSession, DeployError> {
    let credential = target.credential().ok_or_else(|| {
        DeployError::Authentication(format!(
            "Server `{}` has neither a private key nor a password",
            target.name
        ))
    })?;

    let socket_address = format!("{}:{}", target.host, target.port);
    let resolved_socket = socket_address
        .to_socket_addrs()
        .map_err(|error| {
            DeployError::Connection(format!(
                "Failed to resolve server host `{socket_address}`: {error}"
            ))
        })?
        .next()
        .ok_or_else(|| {
            DeployError::Connection(format!("No resolved socket address for `{socket_address}`"))
        })?;

    let tcp_stream = TcpStream::connect_timeout(&resolved_socket, timeout).map_err(|error| {
        DeployError::Connection(format!(
            "Failed to establish TCP connection to `{socket_address}`: {error}"
        ))
    })?;
    let io_timeout = Some(Duration::from_secs(SOCKET_IO_TIMEOUT_SECONDS));
    tcp_stream
        .set_read_timeout(io_timeout)
        .and_then(|_| tcp_stream.set_write_timeout(io_timeout))
        .map_err(|error| {
            DeployError::Connection(format!("Failed to configure TCP timeouts: {error}"))
        })?;

    let mut session = Session::new().map_err(|error| {
        DeployError::Connection(format!("Failed to initialize SSH session: {error}"))
    })?;
    session.set_tcp_stream(tcp_stream);
    session.handshake().map_err(|error| {
        DeployError::Connection(format!("SSH handshake failed for `{socket_address}`: {error}"))
    })?;

    // Host keys are deliberately not checked; the fingerprint is only logged.
    if let Some(fingerprint) = host_key_fingerprint(&session) {
        debug!(server = %target.name, %fingerprint, "SSH handshake completed");
    }

    match credential {
        Credential::PrivateKey { path, passphrase } => {
            let key_path = Path::new(path);
            if !key_path.exists() {
                return Err(DeployError::Authentication(format!(
                    "Private key file does not exist: {}",
                    key_path.display()
                )));
            }
            session
                .userauth_pubkey_file(&target.username, None, key_path, passphrase)
                .map_err(|error| {
                    DeployError::Authentication(format!(
                        "SSH private-key authentication failed: {error}"
                    ))
                })?;
        }
        Credential::Password(password) => {
            session
                .userauth_password(&target.username, password)
                .map_err(|error| {
                    DeployError::Authentication(format!(
                        "SSH password authentication failed: {error}"
                    ))
                })?;
        }
    }

    if !session.authenticated() {
        return Err(DeployError::Authentication(
            "SSH authentication was rejected by the server".to_string(),
        ));
    }

    Ok(SshSession {
        session,
        label: socket_address,
    })
}

impl RemoteSession for SshSession {
    fn execute(
        &mut self,
        command: &str,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<String, DeployError> {
        let mut channel = self.session.channel_session().map_err(|error| {
            DeployError::Connection(format!("Failed to open SSH channel on {}: {error}", self.label))
        })?;
        channel.exec(command).map_err(|error| {
            DeployError::Connection(format!("Failed to execute remote command: {error}"))
        })?;

        self.session.set_blocking(false);
        let polled = poll_channel(&mut channel, command, on_output);
        self.session.set_blocking(true);

        let output = match polled {
            Ok(output) => output,
            Err(error) => {
                let _ = channel.close();
                return Err(error);
            }
        };

        channel.wait_close().map_err(|error| {
            DeployError::Connection(format!("Failed while waiting for SSH command close: {error}"))
        })?;
        let exit_code = channel.exit_status().map_err(|error| {
            DeployError::Connection(format!("Failed to obtain SSH exit status: {error}"))
        })?;

        if exit_code != 0 {
            debug!(command, exit_code, output = %truncate_for_log(&output), "Remote command failed");
            return Err(DeployError::CommandExecution {
                command: command.to_string(),
                exit_code,
            });
        }
        Ok(output)
    }

    fn upload(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<u64, DeployError> {
        let transfer_error = |action: &str, error: &dyn std::fmt::Display| {
            DeployError::Transfer(format!("{action} `{remote_path}` failed: {error}"))
        };

        let mut local = File::open(local_path).map_err(|error| {
            DeployError::Transfer(format!(
                "Cannot open local package `{}`: {error}",
                local_path.display()
            ))
        })?;
        let sftp = self
            .session
            .sftp()
            .map_err(|error| transfer_error("Opening SFTP channel for", &error))?;
        let mut remote = sftp
            .create(Path::new(remote_path))
            .map_err(|error| transfer_error("Creating", &error))?;

        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let read = local
                .read(&mut buffer)
                .map_err(|error| transfer_error("Reading local data for", &error))?;
            if read == 0 {
                break;
            }
            remote
                .write_all(&buffer[..read])
                .map_err(|error| transfer_error("Writing", &error))?;
            sent += read as u64;
            on_chunk(sent);
        }
        remote
            .flush()
            .map_err(|error| transfer_error("Flushing", &error))?;
        Ok(sent)
    }

    fn disconnect(&mut self) {
        if let Err(error) = self.session.disconnect(None, "deployment finished", None) {
            warn!(server = %self.label, "SSH disconnect failed: {error}");
        }
    }
}

/// Reads stdout and stderr without blocking until EOF, sleeping between empty polls.
fn poll_channel(
    channel: &mut Channel,
    command: &str,
    on_output: &mut dyn FnMut(&str),
) -> Result<String, DeployError> {
    let started = Instant::now();
    let mut combined = Vec::new();
    let mut stdout_lines = LineBuffer::new("");
    let mut stderr_lines = LineBuffer::new("ERROR: ");
    let mut buffer = [0u8; 4096];

    loop {
        if started.elapsed() > COMMAND_TIMEOUT {
            return Err(DeployError::Timeout {
                command: command.to_string(),
                seconds: COMMAND_TIMEOUT.as_secs(),
            });
        }

        let read_stdout = drain_stream(
            channel,
            &mut buffer,
            &mut combined,
            &mut stdout_lines,
            on_output,
        )?;
        let read_stderr = drain_stream(
            &mut channel.stderr(),
            &mut buffer,
            &mut combined,
            &mut stderr_lines,
            on_output,
        )?;

        if channel.eof() && !read_stdout && !read_stderr {
            break;
        }
        if !read_stdout && !read_stderr {
            std::thread::sleep(COMMAND_POLL_INTERVAL);
        }
    }

    stdout_lines.finish(on_output);
    stderr_lines.finish(on_output);
    Ok(String::from_utf8_lossy(&combined).to_string())
}

fn drain_stream(
    reader: &mut impl Read,
    buffer: &mut [u8],
    combined: &mut Vec<u8>,
    lines: &mut LineBuffer,
    on_output: &mut dyn FnMut(&str),
) -> Result<bool, DeployError> {
    let mut progressed = false;
    loop {
        match reader.read(buffer) {
            Ok(0) => return Ok(progressed),
            Ok(read) => {
                combined.extend_from_slice(&buffer[..read]);
                lines.push(&buffer[..read], on_output);
                progressed = true;
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(progressed),
            Err(error) => {
                return Err(DeployError::Connection(format!(
                    "Failed to read SSH command output: {error}"
                )))
            }
        }
    }
}

/// Splits a byte stream into complete lines, emitting each one with a prefix.
#[derive(Debug)]
pub struct LineBuffer {
    prefix: &'static str,
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8], on_line: &mut dyn FnMut(&str)) {
        self.pending.extend_from_slice(bytes);
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=position).collect::<Vec<_>>();
            self.emit(&line, on_line);
        }
    }

    /// Emits whatever is left after the stream ended without a trailing newline.
    pub fn finish(&mut self, on_line: &mut dyn FnMut(&str)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line, on_line);
        }
    }

    fn emit(&self, raw: &[u8], on_line: &mut dyn FnMut(&str)) {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if !text.is_empty() {
            on_line(&format!("{}{text}", self.prefix));
        }
    }
}

fn host_key_fingerprint(session: &Session) -> Option<String> {
    let (host_key, _host_key_type) = session.host_key()?;
    let digest = Sha256::digest(host_key);
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}
