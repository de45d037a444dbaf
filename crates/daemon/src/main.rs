//! TabShell Daemon
//!
//! Headless service multiplexing remote terminal tabs over WebSocket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::pidfile::{PidFile, PidFileError};
use daemon::remote::askpass;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// TabShell Daemon - multiplexes remote terminal tabs over one connection.
#[derive(Parser, Debug)]
#[command(name = "tabshell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the TabShell daemon
    Start {
        /// Port to listen on (overrides the configuration)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,
}

fn main() -> anyhow::Result<()> {
    // ssh re-executes this binary to read the password for a tab.
    if askpass::run_if_requested() {
        return Ok(());
    }

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Commands::Start { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }

            let _log_guard = init_tracing(&config, cli.verbose)?;
            tracing::info!("TabShell daemon starting...");
            tracing::debug!("Using config file: {:?}", config_path);

            config.validate()?;

            let pid_file = PidFile::default_location();
            match pid_file.acquire() {
                Ok(()) => {}
                Err(PidFileError::AlreadyRunning(pid)) => {
                    eprintln!("Error: Daemon already running (PID: {})", pid);
                    eprintln!();
                    eprintln!("To stop the existing daemon, run:");
                    eprintln!("  tabshell stop");
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }

            let result = run_headless(config).await;

            if let Err(e) = pid_file.release() {
                tracing::warn!("Failed to remove PID file: {}", e);
            }
            result
        }
        Commands::Stop { force, timeout } => {
            init_cli_tracing(cli.verbose);
            tracing::info!("Stopping daemon (force: {})", force);

            let signal = if force {
                nix::sys::signal::Signal::SIGKILL
            } else {
                nix::sys::signal::Signal::SIGTERM
            };
            match stop_daemon(&PidFile::default_location(), signal, timeout).await {
                Ok(()) => {
                    println!("Daemon stopped successfully");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: tabshell stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            init_cli_tracing(cli.verbose);
            let pid_file = PidFile::default_location();
            match pid_file.running_pid() {
                Some(pid) => {
                    println!("Daemon Status: running");
                    println!("  PID:      {}", pid);
                    println!(
                        "  Listen:   {}:{}",
                        config.server.bind_address, config.server.port
                    );
                    println!("  Host:     {}@{}", config.ssh.user, config.ssh.host);
                    println!("  Program:  {}", config.session.program);
                    Ok(())
                }
                None => {
                    println!("Daemon Status: stopped");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Builds the log filter: `RUST_LOG` wins, then `--verbose`, then the
/// configured level.
fn log_filter(config: &Config, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.daemon.log_level.as_str()
        };
        EnvFilter::new(level)
    })
}

/// Initializes logging for the daemon.
///
/// With `log_file` set, logs go to a daily rotated file through a
/// non-blocking writer; the returned guard must be held until exit.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = log_filter(config, verbose);

    match &config.daemon.log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::daily(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;
            Ok(None)
        }
    }
}

/// Stderr logging for short-lived commands.
fn init_cli_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, file_name))
}

/// Run the daemon until SIGTERM or SIGINT.
async fn run_headless(config: Config) -> anyhow::Result<()> {
    let mut orchestrator = DaemonOrchestrator::new(config)?;

    // Subscribe before starting so state changes are logged too
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected {
                    connection_id,
                    peer,
                } => {
                    tracing::debug!("Client connected: {} from {}", connection_id, peer);
                }
                OrchestratorEvent::ClientDisconnected { connection_id } => {
                    tracing::debug!("Client disconnected: {}", connection_id);
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    orchestrator.start().await?;
    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("Listening on ws://{}", addr);
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Signals the running daemon and waits for it to exit.
async fn stop_daemon(
    pid_file: &PidFile,
    signal: nix::sys::signal::Signal,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = pid_file
        .running_pid()
        .ok_or_else(|| anyhow::anyhow!("Daemon is not running"))?;

    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| anyhow::anyhow!("Failed to signal daemon (PID {}): {}", pid, e))?;
    println!("Sent {} to daemon (PID {})", signal, pid);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !daemon::pidfile::is_process_running(pid) {
            // SIGKILL leaves the PID file behind
            let _ = pid_file.release();
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}
