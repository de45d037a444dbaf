//! Remote execution over the system OpenSSH client.
//!
//! [`SshExecutor::connect`] verifies reachability and credentials with a
//! non-interactive preflight (`ssh ... user@host true`). The interactive shell is
//! then an `ssh -tt user@host` child running on a local PTY from
//! `portable-pty`, so the remote side sees a real terminal and resize requests
//! propagate as window-change events.
//!
//! Password authentication is handed to ssh through `SSH_ASKPASS`, pointing
//! back at this executable in askpass mode (see [`super::askpass`]).

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::askpass::ASKPASS_SECRET_ENV;
use super::{
    AuthMethod, ProcessOutput, RemoteConnection, RemoteError, RemoteExecutor, RemoteProcess,
};
use crate::config::SshConfig;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the in-memory pipe between the blocking reader and the pump.
const BRIDGE_CAPACITY: usize = 64 * 1024;

/// Extra time granted to the preflight on top of ssh's own `ConnectTimeout`.
const PREFLIGHT_GRACE: Duration = Duration::from_secs(5);

/// ssh exits with 255 when the failure is its own rather than the remote command's.
const SSH_FAILURE_EXIT_CODE: i32 = 255;

/// Settings shared by the executor and every connection it creates.
#[derive(Debug, Clone)]
struct SshOptions {
    binary: String,
    port: u16,
    verify_host_keys: bool,
    connect_timeout: Duration,
    askpass_program: Option<PathBuf>,
}

impl SshOptions {
    /// Arguments common to the preflight and the interactive session.
    fn base_args(&self, auth: &AuthMethod) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        if self.verify_host_keys {
            args.extend(["-o".to_string(), "StrictHostKeyChecking=yes".to_string()]);
        } else {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }

        match auth {
            AuthMethod::PublicKey(keys) => {
                args.extend([
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "PreferredAuthentications=publickey".to_string(),
                ]);
                if !keys.is_empty() {
                    args.extend(["-o".to_string(), "IdentitiesOnly=yes".to_string()]);
                    for key in keys {
                        args.push("-i".to_string());
                        args.push(key.display().to_string());
                    }
                }
            }
            AuthMethod::Password(_) => {
                args.extend([
                    "-o".to_string(),
                    "PreferredAuthentications=password,keyboard-interactive".to_string(),
                    "-o".to_string(),
                    "PubkeyAuthentication=no".to_string(),
                    "-o".to_string(),
                    "NumberOfPasswordPrompts=1".to_string(),
                ]);
            }
        }

        args
    }

    /// Environment needed for `auth`.
    fn auth_env(&self, auth: &AuthMethod) -> Result<Vec<(String, String)>, RemoteError> {
        match auth {
            AuthMethod::PublicKey(_) => Ok(Vec::new()),
            AuthMethod::Password(password) => {
                let program = self.askpass_program.as_ref().ok_or_else(|| {
                    RemoteError::AuthFailed("password authentication unavailable".to_string())
                })?;
                Ok(vec![
                    ("SSH_ASKPASS".to_string(), program.display().to_string()),
                    ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
                    (ASKPASS_SECRET_ENV.to_string(), password.clone()),
                ])
            }
        }
    }
}

/// [`RemoteExecutor`] backed by the `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    /// Builds an executor from the `[ssh]` configuration section.
    ///
    /// The current executable doubles as the askpass helper.
    pub fn from_config(config: &SshConfig) -> Self {
        let askpass_program = match std::env::current_exe() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot locate own executable, password authentication disabled");
                None
            }
        };

        Self {
            options: SshOptions {
                binary: config.binary.clone(),
                port: config.port,
                verify_host_keys: config.verify_host_keys,
                connect_timeout: Duration::from_secs(config.connect_timeout_secs),
                askpass_program,
            },
        }
    }

    /// Classifies a failed preflight by its stderr.
    fn preflight_error(code: Option<i32>, stderr: &str) -> RemoteError {
        let detail = if stderr.is_empty() {
            match code {
                Some(code) => format!("ssh exited with status {}", code),
                None => "ssh terminated by signal".to_string(),
            }
        } else {
            stderr.to_string()
        };

        if code == Some(SSH_FAILURE_EXIT_CODE) && stderr.contains("Permission denied") {
            RemoteError::AuthFailed(detail)
        } else {
            RemoteError::ConnectFailed(detail)
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        let target = format!("{}@{}", user, host);

        let mut cmd = tokio::process::Command::new(&self.options.binary);
        cmd.args(self.options.base_args(auth))
            .arg(&target)
            .arg("true")
            .envs(self.options.auth_env(auth)?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(remote = %target, auth = auth.kind(), "Probing SSH connection");

        let output = tokio::time::timeout(
            self.options.connect_timeout + PREFLIGHT_GRACE,
            cmd.output(),
        )
        .await
        .map_err(|_| RemoteError::ConnectFailed(format!("timed out connecting to {}", host)))?
        .map_err(|e| {
            RemoteError::ConnectFailed(format!("failed to run {}: {}", self.options.binary, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Self::preflight_error(output.status.code(), &stderr));
        }

        Ok(Box::new(SshConnection {
            options: self.options.clone(),
            target,
            auth: auth.clone(),
        }))
    }
}

/// A verified `user@host` target plus the credentials that worked.
struct SshConnection {
    options: SshOptions,
    target: String,
    auth: AuthMethod,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn spawn_pty(
        &self,
        term_type: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(Box<dyn RemoteProcess>, ProcessOutput), RemoteError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RemoteError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.options.binary);
        cmd.arg("-tt");
        for arg in self.options.base_args(&self.auth) {
            cmd.arg(arg);
        }
        cmd.arg(&self.target);
        cmd.env("TERM", term_type);
        for (key, value) in self.options.auth_env(&self.auth)? {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RemoteError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave, otherwise the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RemoteError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RemoteError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            remote = %self.target,
            pid = ?child.process_id(),
            cols,
            rows,
            "Spawned remote shell"
        );

        let process = PtyProcess {
            master: Mutex::new(pair.master),
            writer: Arc::new(StdMutex::new(writer)),
            child: Arc::new(StdMutex::new(child)),
        };

        Ok((Box::new(process), bridge_reader(reader)))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        // The ssh child is the connection; closing the process released it.
        Ok(())
    }
}

/// Moves blocking PTY reads onto a dedicated thread and exposes them as an
/// async byte stream.
///
/// The thread ends when the PTY reports EOF or an error (Linux returns `EIO`
/// once the child is gone) or when the async side is dropped.
fn bridge_reader(mut reader: Box<dyn Read + Send>) -> ProcessOutput {
    let (async_side, mut thread_side) = tokio::io::duplex(BRIDGE_CAPACITY);
    let handle = tokio::runtime::Handle::current();

    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if handle.block_on(thread_side.write_all(&buffer[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "PTY reader finished");
                    break;
                }
            }
        }
    });

    Box::new(async_side)
}

/// The local end of an `ssh -tt` child.
struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
}

#[async_trait]
impl RemoteProcess for PtyProcess {
    async fn write(&self, data: &[u8]) -> Result<(), RemoteError> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| RemoteError::WriteFailed("writer lock poisoned".to_string()))?;
            writer
                .write_all(&data)
                .map_err(|e| RemoteError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| RemoteError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| RemoteError::WriteFailed(e.to_string()))?
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), RemoteError> {
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RemoteError::ResizeFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        let child = Arc::clone(&self.child);

        tokio::task::spawn_blocking(move || {
            let mut child = child
                .lock()
                .map_err(|_| RemoteError::CloseFailed("child lock poisoned".to_string()))?;

            if child.try_wait()?.is_none() {
                child
                    .kill()
                    .map_err(|e| RemoteError::CloseFailed(e.to_string()))?;
            }
            let status = child.wait()?;
            tracing::debug!(exit_code = status.exit_code(), "Remote shell exited");
            Ok(())
        })
        .await
        .map_err(|e| RemoteError::CloseFailed(e.to_string()))?
    }
}
