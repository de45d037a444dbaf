//! End-to-end integration tests for TabShell.
//!
//! These tests verify complete flows work correctly:
//! - Daemon startup and shutdown
//! - Tab lifecycle over a real WebSocket connection
//! - Per-tab routing of output
//! - Release of remote sessions on disconnect
//!
//! The remote side is replaced by an in-process echo executor so no `ssh`
//! server is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daemon::config::Config;
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use daemon::protocol::{
    EventCodec, InboundEvent, OutboundEvent, StartSession, StopSession, TerminalInput,
    TerminalResize,
};
use daemon::remote::{
    AuthMethod, ProcessOutput, RemoteConnection, RemoteError, RemoteExecutor, RemoteProcess,
};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Echo executor
// =============================================================================

/// Counts remote processes spawned and released.
#[derive(Default)]
struct Counters {
    spawned: AtomicUsize,
    released: AtomicUsize,
}

/// Executor whose processes echo their input back as output.
struct EchoExecutor {
    counters: Arc<Counters>,
}

struct EchoConnection {
    counters: Arc<Counters>,
}

struct EchoProcess {
    remote: Mutex<Option<DuplexStream>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl RemoteExecutor for EchoExecutor {
    async fn connect(
        &self,
        _host: &str,
        _user: &str,
        _auth: &AuthMethod,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        Ok(Box::new(EchoConnection {
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[async_trait]
impl RemoteConnection for EchoConnection {
    async fn spawn_pty(
        &self,
        _term_type: &str,
        _cols: u16,
        _rows: u16,
    ) -> Result<(Box<dyn RemoteProcess>, ProcessOutput), RemoteError> {
        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let process = EchoProcess {
            remote: Mutex::new(Some(remote)),
            counters: Arc::clone(&self.counters),
        };
        Ok((Box::new(process), Box::new(local)))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[async_trait]
impl RemoteProcess for EchoProcess {
    async fn write(&self, data: &[u8]) -> Result<(), RemoteError> {
        let mut remote = self.remote.lock().await;
        if let Some(remote) = remote.as_mut() {
            remote
                .write_all(data)
                .await
                .map_err(|e| RemoteError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if self.remote.lock().await.take().is_some() {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct TestDaemon {
    orchestrator: DaemonOrchestrator,
    counters: Arc<Counters>,
    _temp_dir: TempDir,
}

impl TestDaemon {
    async fn start() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.session.startup_delay_ms = 0;
        config.session.max_tabs_per_connection = 3;

        let counters = Arc::new(Counters::default());
        let executor = Arc::new(EchoExecutor {
            counters: Arc::clone(&counters),
        });
        let mut orchestrator = DaemonOrchestrator::with_executor(config, executor).unwrap();
        orchestrator.start().await.unwrap();

        Self {
            orchestrator,
            counters,
            _temp_dir: temp_dir,
        }
    }

    async fn client(&self) -> Client {
        let url = format!("ws://{}", self.orchestrator.local_addr().unwrap());
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }
}

async fn send(client: &mut Client, event: InboundEvent) {
    let frame = EventCodec::new().encode(&event).unwrap();
    client.send(WsMessage::Text(frame)).await.unwrap();
}

async fn recv(client: &mut Client) -> OutboundEvent {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .unwrap();
        if let WsMessage::Text(text) = message {
            return EventCodec::new().decode_outbound(&text).unwrap();
        }
    }
}

/// Receives events until one matches, returning everything seen on the way.
async fn recv_until(
    client: &mut Client,
    pred: impl Fn(&OutboundEvent) -> bool,
) -> Vec<OutboundEvent> {
    let mut seen = Vec::new();
    loop {
        let event = recv(client).await;
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Concatenated `terminal_output` data for `tab` until `needle` shows up.
async fn output_until(client: &mut Client, tab: &str, needle: &str) -> String {
    let mut output = String::new();
    loop {
        match recv(client).await {
            OutboundEvent::TerminalOutput { tab_id, data } if tab_id == tab => {
                output.push_str(&data);
                if output.contains(needle) {
                    return output;
                }
            }
            _ => {}
        }
    }
}

async fn start_tab(client: &mut Client, workspace: &str, tab: &str) {
    send(
        client,
        InboundEvent::StartSession(StartSession::new(workspace, tab)),
    )
    .await;
    let seen = recv_until(client, |e| {
        matches!(e, OutboundEvent::SessionStarted { .. } | OutboundEvent::TerminalError { .. })
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&OutboundEvent::SessionStarted {
            tab_id: tab.to_string(),
            workspace: workspace.to_string(),
        })
    );
}

async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Orchestrator Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_orchestrator_start_and_stop() {
    let daemon = TestDaemon::start().await;
    assert_eq!(daemon.orchestrator.state().await, OrchestratorState::Running);

    daemon.orchestrator.stop().await.unwrap();
    assert_eq!(daemon.orchestrator.state().await, OrchestratorState::Stopped);
}

// =============================================================================
// Tab Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_tab_round_trip() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    start_tab(&mut client, "proj", "1").await;

    // The startup command is echoed back like a remote shell would
    let output = output_until(&mut client, "1", "exec claude").await;
    assert!(output.contains("cd '/"));
    assert!(output.contains("proj' && clear && exec claude"));

    send(
        &mut client,
        InboundEvent::TerminalInput(TerminalInput {
            tab_id: "1".to_string(),
            data: "echo hi\n".to_string(),
        }),
    )
    .await;
    output_until(&mut client, "1", "echo hi").await;

    send(
        &mut client,
        InboundEvent::TerminalResize(TerminalResize {
            tab_id: "1".to_string(),
            cols: 200,
            rows: 50,
        }),
    )
    .await;

    send(
        &mut client,
        InboundEvent::StopSession(StopSession {
            tab_id: "1".to_string(),
        }),
    )
    .await;
    let seen = recv_until(&mut client, |e| {
        matches!(e, OutboundEvent::SessionStopped { .. })
    })
    .await;
    assert!(seen
        .iter()
        .all(|e| !matches!(e, OutboundEvent::SessionClosed { .. })));

    wait_for(|| daemon.released() == 1).await;
    assert_eq!(daemon.orchestrator.registry().session_count(), 0);
}

#[tokio::test]
async fn test_output_is_routed_per_tab() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    start_tab(&mut client, "alpha", "a").await;
    start_tab(&mut client, "beta", "b").await;

    send(
        &mut client,
        InboundEvent::TerminalInput(TerminalInput {
            tab_id: "b".to_string(),
            data: "only-for-b\n".to_string(),
        }),
    )
    .await;

    let mut a_output = String::new();
    let mut b_output = String::new();
    while !b_output.contains("only-for-b") {
        match recv(&mut client).await {
            OutboundEvent::TerminalOutput { tab_id, data } if tab_id == "a" => {
                a_output.push_str(&data)
            }
            OutboundEvent::TerminalOutput { tab_id, data } if tab_id == "b" => {
                b_output.push_str(&data)
            }
            _ => {}
        }
    }
    assert!(!a_output.contains("only-for-b"));
}

#[tokio::test]
async fn test_duplicate_tab_and_tab_limit() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    start_tab(&mut client, "proj", "1").await;

    send(
        &mut client,
        InboundEvent::StartSession(StartSession::new("proj", "1")),
    )
    .await;
    let seen = recv_until(&mut client, |e| {
        matches!(e, OutboundEvent::TerminalError { .. })
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&OutboundEvent::TerminalError {
            tab_id: "1".to_string(),
            message: "Tab already active: 1".to_string(),
        })
    );

    start_tab(&mut client, "proj", "2").await;
    start_tab(&mut client, "proj", "3").await;

    send(
        &mut client,
        InboundEvent::StartSession(StartSession::new("proj", "4")),
    )
    .await;
    let seen = recv_until(&mut client, |e| {
        matches!(e, OutboundEvent::TerminalError { .. })
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&OutboundEvent::TerminalError {
            tab_id: "4".to_string(),
            message: "Too many tabs open (limit 3)".to_string(),
        })
    );
}

#[tokio::test]
async fn test_missing_workspace_is_rejected() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    client
        .send(WsMessage::Text(
            r#"{"event":"start_session","data":{"tab_id":"1"}}"#.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(
        recv(&mut client).await,
        OutboundEvent::TerminalError {
            tab_id: "1".to_string(),
            message: "Workspace is required".to_string(),
        }
    );
    assert_eq!(daemon.counters.spawned.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Disconnect Tests
// =============================================================================

#[tokio::test]
async fn test_disconnect_releases_all_tabs() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    start_tab(&mut client, "proj", "1").await;
    start_tab(&mut client, "proj", "2").await;
    assert_eq!(daemon.orchestrator.registry().session_count(), 2);

    client.close(None).await.unwrap();

    wait_for(|| daemon.released() == 2).await;
    wait_for(|| daemon.orchestrator.connection_count() == 0).await;
    assert_eq!(daemon.orchestrator.registry().session_count(), 0);
}

#[tokio::test]
async fn test_clients_are_isolated() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.client().await;
    let mut second = daemon.client().await;

    // Same tab id on two connections
    start_tab(&mut first, "proj", "1").await;
    start_tab(&mut second, "proj", "1").await;
    assert_eq!(daemon.orchestrator.connection_count(), 2);

    first.close(None).await.unwrap();
    wait_for(|| daemon.released() == 1).await;

    send(
        &mut second,
        InboundEvent::TerminalInput(TerminalInput {
            tab_id: "1".to_string(),
            data: "still here\n".to_string(),
        }),
    )
    .await;
    output_until(&mut second, "1", "still here").await;
}

#[tokio::test]
async fn test_shutdown_releases_connected_clients() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;

    start_tab(&mut client, "proj", "1").await;

    daemon.orchestrator.stop().await.unwrap();

    assert_eq!(daemon.released(), 1);
    assert_eq!(daemon.orchestrator.connection_count(), 0);
}
