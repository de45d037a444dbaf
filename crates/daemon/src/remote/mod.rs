//! Remote execution collaborators.
//!
//! A session never talks to SSH directly. It goes through three traits:
//!
//! - [`RemoteExecutor`] authenticates and yields a [`RemoteConnection`]
//! - [`RemoteConnection`] spawns a PTY-backed shell
//! - [`RemoteProcess`] is the live shell: input, resize, close
//!
//! The shell's output is handed out separately as a [`ProcessOutput`] reader so
//! the output pump can own it outright. [`RemoteProcess::close`] must cause
//! any read pending on that reader to finish.
//!
//! [`ssh`] provides the production implementation on top of the system
//! OpenSSH client.

pub mod askpass;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use ssh::SshExecutor;

/// Byte stream carrying everything the remote process prints.
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Errors reported by remote execution backends.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The remote side rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The remote host could not be reached.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The PTY or shell could not be started.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Input could not be delivered.
    #[error("failed to write to remote process: {0}")]
    WriteFailed(String),

    /// The PTY could not be resized.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Releasing the process or connection failed.
    #[error("failed to close remote process: {0}")]
    CloseFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One way of proving who we are to the remote host.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Public-key authentication with the given private key files.
    /// An empty list leaves key selection to the backend (agent, defaults).
    PublicKey(Vec<PathBuf>),
    /// Password authentication.
    Password(String),
}

impl AuthMethod {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey(keys) => f.debug_tuple("PublicKey").field(keys).finish(),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Credentials offered when opening a session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Private key files tried first.
    pub key_candidates: Vec<PathBuf>,
    /// Password tried when public-key authentication fails.
    pub password: Option<String>,
}

impl Credentials {
    /// Creates credentials from key candidates and an optional password.
    pub fn new(key_candidates: Vec<PathBuf>, password: Option<String>) -> Self {
        Self {
            key_candidates,
            password: password.filter(|p| !p.is_empty()),
        }
    }

    /// Authentication attempts in the order they should be tried:
    /// public keys first, then the password if one was supplied.
    pub fn auth_attempts(&self) -> Vec<AuthMethod> {
        let mut attempts = vec![AuthMethod::PublicKey(self.key_candidates.clone())];
        if let Some(password) = &self.password {
            attempts.push(AuthMethod::Password(password.clone()));
        }
        attempts
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_candidates", &self.key_candidates)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Authenticates against a remote host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Connects to `host` as `user` using a single authentication method.
    async fn connect(
        &self,
        host: &str,
        user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError>;
}

/// An authenticated connection able to host a PTY.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Spawns an interactive shell on a PTY of the given size.
    async fn spawn_pty(
        &self,
        term_type: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(Box<dyn RemoteProcess>, ProcessOutput), RemoteError>;

    /// Closes the connection and waits until it is fully shut down.
    async fn close(&self) -> Result<(), RemoteError>;
}

/// A live PTY-backed remote process.
#[async_trait]
pub trait RemoteProcess: Send + Sync {
    /// Writes input to the process.
    async fn write(&self, data: &[u8]) -> Result<(), RemoteError>;

    /// Changes the PTY geometry.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), RemoteError>;

    /// Terminates the process and waits for it to be fully closed.
    ///
    /// Any read pending on the process output must complete afterwards.
    async fn close(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_attempts_publickey_only() {
        let creds = Credentials::new(vec![PathBuf::from("/home/u/.ssh/id_ed25519")], None);
        assert_eq!(
            creds.auth_attempts(),
            vec![AuthMethod::PublicKey(vec![PathBuf::from(
                "/home/u/.ssh/id_ed25519"
            )])]
        );
    }

    #[test]
    fn test_auth_attempts_password_fallback_last() {
        let creds = Credentials::new(vec![], Some("secret".to_string()));
        let attempts = creds.auth_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].kind(), "publickey");
        assert_eq!(attempts[1], AuthMethod::Password("secret".to_string()));
    }

    #[test]
    fn test_empty_password_is_ignored() {
        let creds = Credentials::new(vec![], Some(String::new()));
        assert_eq!(creds.auth_attempts().len(), 1);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new(vec![], Some("secret".to_string()));
        assert!(!format!("{:?}", creds).contains("secret"));
        assert!(!format!("{:?}", AuthMethod::Password("secret".to_string())).contains("secret"));
    }
}
