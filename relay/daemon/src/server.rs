//! Daemon Server Implementation
//!
//! This module provides the server loop for the relay daemon:
//! - Accepts connections on a Unix socket
//! - Runs one chat turn per connection
//! - Tracks active connections so they can be aborted on shutdown
//!
//! # Protocol
//!
//! A client sends one line of JSON and receives server-sent events until the
//! turn ends, then the daemon closes the connection:
//!
//! ```text
//! → {"query":"Hi","conversationId":null,"userId":"alice"}
//! ← id: 1
//!   event: message
//!   data: {"conversationId":"…","content":"H"}
//!
//! ← id: 2
//!   …
//! ```
//!
//! A request rejected before any frame was written (malformed JSON, invalid
//! input, storage failure) is answered with a single error frame.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::{RelayError, TurnCoordinator, WireFrame};

/// Connection identifier, unique for the daemon's lifetime
pub type ConnectionId = u64;

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Longest accepted request line, in bytes
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_request_bytes: 256 * 1024,
        }
    }
}

/// One chat turn request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// The user's query
    pub query: String,
    /// Conversation to continue (a new one is started when absent)
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Requesting user
    pub user_id: String,
}

/// How a connection ended
#[derive(Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The client closed without sending a request
    NoRequest,
    /// Answered with a single rejection frame
    Rejected,
    /// All frames written
    Completed {
        /// Frames written
        frames: usize,
    },
    /// The turn terminated abnormally after `frames` frames
    Failed {
        /// Frames written
        frames: usize,
    },
    /// The client went away mid-turn
    Disconnected {
        /// Frames written before the write failed
        frames: usize,
    },
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// Turn pipeline shared by all connections
    coordinator: TurnCoordinator,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    /// Next connection ID
    next_conn_id: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, coordinator: TurnCoordinator, server_config: ServerConfig) -> Self {
        Self {
            socket_path,
            server_config,
            coordinator,
            connection_states: Arc::new(DashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        stream.peer_cred().ok().map(|cred| cred.uid())
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the accept loop until `shutdown` is set
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or cleaned up.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        // Owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, "Listening for connections");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);

            // Same user (or root) only
            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(peer_uid = uid, our_uid, "Rejecting connection from different user");
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let coordinator = self.coordinator.clone();
            let connection_states = Arc::clone(&self.connection_states);
            let max_request_bytes = self.server_config.max_request_bytes;

            // Held back until the connection is tracked, so it cannot
            // finish before it is registered
            let (registered_tx, registered_rx) = oneshot::channel::<()>();

            let task_handle = tokio::spawn(
                async move {
                    let _ = registered_rx.await;
                    let started = Instant::now();
                    match serve_turn(&coordinator, stream, max_request_bytes).await {
                        Ok(outcome) => info!(
                            outcome = ?outcome,
                            elapsed_ms = started.elapsed().as_millis(),
                            "Connection finished"
                        ),
                        Err(e) => warn!(error = %e, "Connection failed"),
                    }
                    connection_states.remove(&conn_id);
                }
                .instrument(tracing::info_span!("connection", conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id,
                    peer_uid = ?state.peer_uid,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to unwind
        tokio::time::sleep(Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Read one request from `stream` and answer it with SSE frames
///
/// # Errors
///
/// Returns an error if the request cannot be read or a rejection frame
/// cannot be written.
pub async fn serve_turn<S>(
    coordinator: &TurnCoordinator,
    stream: S,
    max_request_bytes: usize,
) -> Result<TurnOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half).take(max_request_bytes as u64);

    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read request")?;
    if read == 0 {
        debug!("Client closed before sending a request");
        return Ok(TurnOutcome::NoRequest);
    }

    let request: TurnRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            let err = RelayError::Validation(format!("malformed request: {e}"));
            warn!(error = %err, "Rejecting request");
            write_frame(&mut writer, &WireFrame::rejection(&err)).await?;
            writer.shutdown().await.ok();
            return Ok(TurnOutcome::Rejected);
        }
    };
    debug!(
        user_id = %request.user_id,
        conversation_id = ?request.conversation_id,
        query_chars = request.query.chars().count(),
        "Turn requested"
    );

    let mut frames = coordinator.stream_turn(
        &request.query,
        request.conversation_id.as_deref(),
        &request.user_id,
    );
    let mut written = 0usize;

    let outcome = loop {
        let Some(item) = frames.next().await else {
            break TurnOutcome::Completed { frames: written };
        };

        match item {
            Ok(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    // Dropping the frame stream detaches the client branch only
                    debug!(error = %e, frames = written, "Client went away");
                    return Ok(TurnOutcome::Disconnected { frames: written });
                }
                written += 1;
            }
            Err(err) if written == 0 => {
                warn!(error = %err, kind = err.kind(), "Turn rejected");
                write_frame(&mut writer, &WireFrame::rejection(&err)).await?;
                break TurnOutcome::Rejected;
            }
            Err(err) => {
                warn!(error = %err, kind = err.kind(), frames = written, "Turn terminated abnormally");
                break TurnOutcome::Failed { frames: written };
            }
        }
    };

    writer.shutdown().await.ok();
    Ok(outcome)
}

async fn write_frame<W>(writer: &mut W, frame: &WireFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let sse = frame.to_sse().context("Failed to encode frame")?;
    writer.write_all(sse.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures::stream;
    use relay_core::{
        ActiveRequestGauge, ConversationStore, EndOfStreamSave, InMemoryStore, MessageRole,
        ModelTransport, PersistenceHealth, RawTokenStream, ReasoningFilter, TokenSource,
        WorkerPools,
    };

    struct FixedSource {
        tokens: Vec<&'static str>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn open(&self, _query: &str) -> anyhow::Result<RawTokenStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let tokens: Vec<anyhow::Result<String>> =
                self.tokens.iter().map(|t| Ok((*t).to_string())).collect();
            Ok(stream::iter(tokens).boxed())
        }
    }

    fn coordinator(
        tokens: Vec<&'static str>,
    ) -> (TurnCoordinator, Arc<InMemoryStore>, Arc<FixedSource>) {
        let pools = Arc::new(WorkerPools::current());
        let store = Arc::new(InMemoryStore::new());
        let source = Arc::new(FixedSource {
            tokens,
            opened: AtomicUsize::new(0),
        });
        let transport = ModelTransport::new(
            source.clone(),
            ReasoningFilter::default(),
            ActiveRequestGauge::new(),
            Arc::clone(&pools),
        );
        let sink = Arc::new(EndOfStreamSave::new(
            store.clone(),
            Arc::new(PersistenceHealth::default()),
            Arc::clone(&pools),
        ));
        (
            TurnCoordinator::new(store.clone(), transport, sink, pools),
            store,
            source,
        )
    }

    async fn exchange(coordinator: &TurnCoordinator, request: &str) -> (TurnOutcome, String) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(request.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();
        let serve = serve_turn(coordinator, server, 1024);
        let read = async {
            let mut out = String::new();
            client_read.read_to_string(&mut out).await.unwrap();
            out
        };

        let (outcome, output) = tokio::join!(serve, read);
        (outcome.unwrap(), output)
    }

    fn data_lines(output: &str) -> Vec<serde_json::Value> {
        output
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_streams_sse_frames() {
        let (coordinator, store, source) = coordinator(vec!["H", "i"]);

        let (outcome, output) =
            exchange(&coordinator, "{\"query\":\"Hi\",\"userId\":\"alice\"}\n").await;

        assert_eq!(outcome, TurnOutcome::Completed { frames: 2 });
        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
        assert!(output.starts_with("id: 1\nevent: message\ndata: "));
        assert!(output.contains("id: 2\nevent: message\n"));

        let data = data_lines(&output);
        assert_eq!(data[0]["content"], "H");
        assert_eq!(data[1]["content"], "i");
        assert_eq!(data[0]["conversationId"], data[1]["conversationId"]);

        let id = data[0]["conversationId"].as_str().unwrap().parse().unwrap();
        let conversation = store.get(id).unwrap().unwrap();
        let reply: Vec<_> = conversation.messages_by(MessageRole::Assistant).collect();
        assert_eq!(reply[0].content, "Hi");
    }

    #[tokio::test]
    async fn test_malformed_request_is_rejected() {
        let (coordinator, _store, source) = coordinator(vec!["x"]);

        let (outcome, output) = exchange(&coordinator, "not json\n").await;

        assert_eq!(outcome, TurnOutcome::Rejected);
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
        assert!(output.starts_with("id: error\nevent: error\n"));
        assert!(output.contains("malformed request"));
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let (coordinator, _store, source) = coordinator(vec!["x"]);

        let (outcome, output) =
            exchange(&coordinator, "{\"query\":\"  \",\"userId\":\"alice\"}\n").await;

        assert_eq!(outcome, TurnOutcome::Rejected);
        assert_eq!(source.opened.load(Ordering::SeqCst), 0);
        let data = data_lines(&output);
        assert_eq!(data.len(), 1);
        assert_eq!(
            data[0]["conversationId"],
            "00000000-0000-0000-0000-000000000000"
        );
        assert!(data[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_empty_connection() {
        let (coordinator, _store, _source) = coordinator(vec!["x"]);
        let (outcome, output) = exchange(&coordinator, "").await;

        assert_eq!(outcome, TurnOutcome::NoRequest);
        assert!(output.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("relay.sock");
        let (coordinator, _store, _source) = coordinator(vec!["o", "k"]);

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = DaemonServer::new(socket_path.clone(), coordinator, ServerConfig::default());
        let server_shutdown = Arc::clone(&shutdown);
        let server_task = tokio::spawn(async move { server.run(server_shutdown).await });

        let mut client = None;
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(&socket_path).await {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut client = client.expect("daemon did not start listening");

        client
            .write_all(b"{\"query\":\"ok?\",\"conversationId\":null,\"userId\":\"bob\"}\n")
            .await
            .unwrap();
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();

        let contents: Vec<_> = data_lines(&output)
            .into_iter()
            .map(|d| d["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["o", "k"]);

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_request_bytes, 256 * 1024);
    }
}
