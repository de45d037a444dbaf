//! PID file utilities for daemon running detection.
//!
//! ## PID File Location
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/tabshell/tabshell.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/tabshell/tabshell.pid` otherwise
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::pidfile::PidFile;
//!
//! let pid_file = PidFile::default_location();
//! if let Some(pid) = pid_file.running_pid() {
//!     println!("TabShell is already running with PID {}", pid);
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors returned when claiming or releasing a PID file.
#[derive(Error, Debug)]
pub enum PidFileError {
    /// Another live process owns the PID file.
    #[error("TabShell is already running (PID: {0})")]
    AlreadyRunning(u32),

    /// The PID file could not be written or removed.
    #[error("PID file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Get the path to the daemon PID file.
///
/// The path follows the XDG Base Directory Specification.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("tabshell").join("tabshell.pid")
}

/// A PID file at a fixed path.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// PID file at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// PID file at [`get_pid_file_path`].
    pub fn default_location() -> Self {
        Self::at(get_pid_file_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the PID of the running daemon, if any.
    ///
    /// Stale or unparsable PID files are removed.
    pub fn running_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;

        let pid: u32 = match contents.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                cleanup_stale_pid_file(&self.path);
                return None;
            }
        };

        if is_process_running(pid) {
            Some(pid)
        } else {
            cleanup_stale_pid_file(&self.path);
            None
        }
    }

    /// Check if a daemon process is currently running.
    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Records the current process as the running daemon.
    ///
    /// Fails with [`PidFileError::AlreadyRunning`] if a live process already
    /// owns the file.
    pub fn acquire(&self) -> Result<(), PidFileError> {
        if let Some(pid) = self.running_pid() {
            if pid != std::process::id() {
                return Err(PidFileError::AlreadyRunning(pid));
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        fs::write(&self.path, std::process::id().to_string())
            .map_err(|source| self.io_error(source))?;

        tracing::debug!(path = %self.path.display(), pid = std::process::id(), "Wrote PID file");
        Ok(())
    }

    /// Removes the PID file. A missing file is not an error.
    pub fn release(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed PID file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists.
/// On other Unix systems, this sends signal 0.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove stale PID file {:?}: {}", path, e);
        }
    } else {
        tracing::debug!("Removed stale PID file {:?}", path);
    }
}
