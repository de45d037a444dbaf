//! In-memory remote backend for tests.
//!
//! Every spawned process is a `tokio::io::duplex` pair: the daemon reads the
//! client end, the stub keeps the other end. Dropping the stub end is how the
//! "remote process" exits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};

use super::{
    AuthMethod, ProcessOutput, RemoteConnection, RemoteError, RemoteExecutor, RemoteProcess,
};

const STUB_PIPE_CAPACITY: usize = 64 * 1024;

/// Pause between scripted chunks, so each one reaches the reader on its own.
const SCRIPT_CHUNK_GAP: Duration = Duration::from_millis(5);

/// Counters and recordings shared by a stub executor and everything it spawns.
#[derive(Default)]
pub(crate) struct StubStats {
    pub connects: AtomicUsize,
    pub spawns: AtomicUsize,
    pub closes: AtomicUsize,
    pub writes: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub auth_seen: Mutex<Vec<AuthMethod>>,
}

impl StubStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.writes.lock().unwrap()).into_owned()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubMode {
    /// Input is written straight back to the output.
    Echo,
    /// Input is recorded and nothing is printed.
    Silent,
}

/// Configurable fake remote host.
pub(crate) struct StubExecutor {
    mode: StubMode,
    connect_error: Option<String>,
    accepted_password: Option<String>,
    spawn_fails: bool,
    fail_close_on_spawn: Option<usize>,
    connect_delay: Duration,
    close_delay: Duration,
    script: Vec<Vec<u8>>,
    exit_after_script: bool,
    stats: Arc<StubStats>,
    ends: Arc<Mutex<Vec<Arc<StubEnd>>>>,
}

impl StubExecutor {
    fn with_mode(mode: StubMode) -> Self {
        Self {
            mode,
            connect_error: None,
            accepted_password: None,
            spawn_fails: false,
            fail_close_on_spawn: None,
            connect_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            script: Vec::new(),
            exit_after_script: false,
            stats: Arc::new(StubStats::default()),
            ends: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn echo() -> Self {
        Self::with_mode(StubMode::Echo)
    }

    pub fn silent() -> Self {
        Self::with_mode(StubMode::Silent)
    }

    /// Every connection attempt fails with `message`.
    pub fn refusing(message: &str) -> Self {
        let mut stub = Self::silent();
        stub.connect_error = Some(message.to_string());
        stub
    }

    /// Public keys are rejected; only `password` is accepted.
    pub fn password_only(mut self, password: &str) -> Self {
        self.accepted_password = Some(password.to_string());
        self
    }

    pub fn failing_spawn(mut self) -> Self {
        self.spawn_fails = true;
        self
    }

    /// The process from the `index`-th spawn (0-based) fails on release.
    pub fn failing_close_on(mut self, index: usize) -> Self {
        self.fail_close_on_spawn = Some(index);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Every process takes `delay` to release, like a remote that hangs on logout.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Chunks printed one by one right after spawn, optionally followed by exit.
    pub fn with_script(mut self, chunks: Vec<Vec<u8>>, exit_after: bool) -> Self {
        self.script = chunks;
        self.exit_after_script = exit_after;
        self
    }

    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }

    /// Makes every live process exit on its own, as a remote logout would.
    pub async fn exit_all(&self) {
        let ends: Vec<Arc<StubEnd>> = self.ends.lock().unwrap().clone();
        for end in ends {
            end.stream.lock().await.take();
        }
    }
}

#[async_trait]
impl RemoteExecutor for StubExecutor {
    async fn connect(
        &self,
        _host: &str,
        _user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        self.stats.auth_seen.lock().unwrap().push(auth.clone());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        if let Some(message) = &self.connect_error {
            return Err(RemoteError::ConnectFailed(message.clone()));
        }

        if let Some(expected) = &self.accepted_password {
            match auth {
                AuthMethod::Password(given) if given == expected => {}
                _ => {
                    return Err(RemoteError::AuthFailed(format!(
                        "{} rejected",
                        auth.kind()
                    )))
                }
            }
        }

        Ok(Box::new(StubConnection {
            mode: self.mode,
            spawn_fails: self.spawn_fails,
            fail_close_on_spawn: self.fail_close_on_spawn,
            close_delay: self.close_delay,
            script: self.script.clone(),
            exit_after_script: self.exit_after_script,
            stats: self.stats.clone(),
            ends: self.ends.clone(),
        }))
    }
}

struct StubConnection {
    mode: StubMode,
    spawn_fails: bool,
    fail_close_on_spawn: Option<usize>,
    close_delay: Duration,
    script: Vec<Vec<u8>>,
    exit_after_script: bool,
    stats: Arc<StubStats>,
    ends: Arc<Mutex<Vec<Arc<StubEnd>>>>,
}

#[async_trait]
impl RemoteConnection for StubConnection {
    async fn spawn_pty(
        &self,
        _term_type: &str,
        _cols: u16,
        _rows: u16,
    ) -> Result<(Box<dyn RemoteProcess>, ProcessOutput), RemoteError> {
        if self.spawn_fails {
            return Err(RemoteError::SpawnFailed("no PTY available".to_string()));
        }

        let index = self.stats.spawns.fetch_add(1, Ordering::SeqCst);
        let (client, remote) = tokio::io::duplex(STUB_PIPE_CAPACITY);

        let end = Arc::new(StubEnd {
            stream: tokio::sync::Mutex::new(Some(remote)),
        });
        self.ends.lock().unwrap().push(end.clone());

        if !self.script.is_empty() || self.exit_after_script {
            tokio::spawn(play_script(
                end.clone(),
                self.script.clone(),
                self.exit_after_script,
            ));
        }

        let process = StubProcess {
            mode: self.mode,
            end,
            fail_close: self.fail_close_on_spawn == Some(index),
            close_delay: self.close_delay,
            stats: self.stats.clone(),
        };

        Ok((Box::new(process), Box::new(client)))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

struct StubEnd {
    stream: tokio::sync::Mutex<Option<DuplexStream>>,
}

async fn play_script(end: Arc<StubEnd>, script: Vec<Vec<u8>>, exit_after: bool) {
    for (i, chunk) in script.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(SCRIPT_CHUNK_GAP).await;
        }
        let mut stream = end.stream.lock().await;
        let Some(stream) = stream.as_mut() else {
            return;
        };
        if stream.write_all(chunk).await.is_err() {
            return;
        }
    }
    if exit_after {
        end.stream.lock().await.take();
    }
}

struct StubProcess {
    mode: StubMode,
    end: Arc<StubEnd>,
    fail_close: bool,
    close_delay: Duration,
    stats: Arc<StubStats>,
}

#[async_trait]
impl RemoteProcess for StubProcess {
    async fn write(&self, data: &[u8]) -> Result<(), RemoteError> {
        self.stats.writes.lock().unwrap().extend_from_slice(data);

        if self.mode == StubMode::Echo {
            let mut stream = self.end.stream.lock().await;
            if let Some(stream) = stream.as_mut() {
                stream
                    .write_all(data)
                    .await
                    .map_err(|e| RemoteError::WriteFailed(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), RemoteError> {
        self.stats.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.end.stream.lock().await.take();
        self.stats.closes.fetch_add(1, Ordering::SeqCst);

        if self.fail_close {
            return Err(RemoteError::CloseFailed("stub release failure".to_string()));
        }
        Ok(())
    }
}

/// Key candidates that never exist on disk.
pub(crate) fn fake_keys() -> Vec<PathBuf> {
    vec![PathBuf::from("/nonexistent/.ssh/id_ed25519")]
}
