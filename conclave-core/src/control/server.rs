//! Node-side control server
//!
//! Listens on the node's Unix socket and answers one command per connection.
//! `subscribe_events` keeps the connection open and streams events until the
//! client disconnects or the server shuts down.

use super::address::AddressResolver;
use super::protocol::{ControlCommand, ControlResponse, ResponseStatus};
use crate::error::Result;
use crate::events::{EventStream, EventType};
use crate::metrics::NodeMetrics;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest request line the server reads
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Node behavior reachable through the control socket
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Add a peer; `true` when the node now treats `target` as reachable
    async fn connect_peer(&self, target: &str, endpoint: &str) -> bool;
}

struct ServerState {
    node: String,
    handler: Arc<dyn NodeHandler>,
    metrics: NodeMetrics,
    events: Arc<EventStream>,
    shutdown: CancellationToken,
}

/// Control-socket server for one node
pub struct ControlServer {
    state: Arc<ServerState>,
    listener: UnixListener,
    path: PathBuf,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("node", &self.state.node)
            .field("path", &self.path)
            .finish()
    }
}

impl ControlServer {
    /// Bind the socket for `node`, replacing any stale socket file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created or the socket bound.
    pub async fn bind(
        node: impl Into<String>,
        resolver: &dyn AddressResolver,
        handler: Arc<dyn NodeHandler>,
        metrics: NodeMetrics,
        events: Arc<EventStream>,
    ) -> Result<Self> {
        let node = node.into();
        let path = resolver.socket_path(&node);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_socket(&path).await?;

        let listener = UnixListener::bind(&path)?;
        info!("Control socket for node {} listening at {}", node, path.display());

        Ok(Self {
            state: Arc::new(ServerState {
                node,
                handler,
                metrics,
                events,
                shutdown: CancellationToken::new(),
            }),
            listener,
            path,
        })
    }

    /// Socket path this server is bound to
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Token cancelled when the server stops; cancel it to stop the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Accept connections until shut down, then remove the socket file.
    ///
    /// A `shutdown` command cancels the token after its response is written.
    pub async fn serve(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, stream).await {
                                debug!("Control connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept control connection: {}", e);
                    }
                },
            }
        }

        drop(self.listener);
        remove_socket(&self.path).await?;
        info!("Control socket for node {} closed", self.state.node);
        Ok(())
    }
}

async fn remove_socket(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.to_line()?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line, stopping one byte past `MAX_REQUEST_LINE`
async fn read_bounded_line<R>(reader: &mut R, line: &mut String) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader
        .take(MAX_REQUEST_LINE as u64 + 1)
        .read_line(line)
        .await
}

async fn handle_connection(state: Arc<ServerState>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    match read_bounded_line(&mut reader, &mut line).await? {
        0 => return Ok(()),
        read if read > MAX_REQUEST_LINE => {
            debug!("Rejected oversized control request on node {}", state.node);
            let response =
                ControlResponse::error(format!("Request exceeds {} bytes", MAX_REQUEST_LINE));
            return write_response(&mut writer, &response).await;
        }
        _ => {}
    }

    let command = match ControlCommand::parse(&line) {
        Ok(command) => command,
        Err(e) => {
            debug!("Rejected control request on node {}: {}", state.node, e);
            return write_response(&mut writer, &ControlResponse::from_error(&e)).await;
        }
    };

    if let Err(e) = state.metrics.inc_control_command(command.name()).await {
        warn!("Failed to record control command metric: {}", e);
    }
    if !matches!(
        command,
        ControlCommand::Health | ControlCommand::SubscribeEvents
    ) {
        state
            .events
            .emit(EventType::ControlCommand, json!({ "command": command.name() }))
            .await;
    }

    match command {
        ControlCommand::Health => {
            write_response(&mut writer, &ControlResponse::status(ResponseStatus::Ready)).await
        }
        ControlCommand::Connect { target, endpoint } => {
            let connected = state.handler.connect_peer(&target, &endpoint).await;
            let payload = json!({ "peer": target, "endpoint": endpoint });
            let status = if connected {
                if let Err(e) = state.metrics.inc_connections(&target).await {
                    warn!("Failed to record connection metric: {}", e);
                }
                state.events.emit(EventType::PeerConnected, payload).await;
                ResponseStatus::Connected
            } else {
                if let Err(e) = state.metrics.inc_connection_errors(&target).await {
                    warn!("Failed to record connection error metric: {}", e);
                }
                state.events.emit(EventType::PeerConnectFailed, payload).await;
                ResponseStatus::Failed
            };
            write_response(&mut writer, &ControlResponse::status(status)).await
        }
        ControlCommand::Shutdown => {
            info!("Node {} received shutdown command", state.node);
            let result =
                write_response(&mut writer, &ControlResponse::status(ResponseStatus::ShuttingDown))
                    .await;
            state.shutdown.cancel();
            result
        }
        ControlCommand::Metrics { format } => {
            let metrics = state.metrics.collector().export(format).await;
            write_response(&mut writer, &ControlResponse::Metrics { metrics }).await
        }
        ControlCommand::SubscribeEvents => {
            let mut events = state.events.subscribe();
            write_response(&mut writer, &ControlResponse::status(ResponseStatus::Subscribed))
                .await?;
            debug!("Event subscriber attached to node {}", state.node);

            let mut discard = String::new();
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    read = read_bounded_line(&mut reader, &mut discard) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => discard.clear(),
                    },
                    received = events.recv() => match received {
                        Ok(event) => {
                            if write_response(&mut writer, &ControlResponse::Event { event })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event subscriber on node {} lagged by {} events", state.node, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            debug!("Event subscriber detached from node {}", state.node);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SocketDir;
    use crate::metrics::MetricsCollector;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;

    struct StaticPeers;

    #[async_trait]
    impl NodeHandler for StaticPeers {
        async fn connect_peer(&self, target: &str, _endpoint: &str) -> bool {
            target == "beta"
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        path: PathBuf,
        events: Arc<EventStream>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    async fn start_server() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SocketDir::new(dir.path());
        let metrics = NodeMetrics::new("alpha", Arc::new(MetricsCollector::new()))
            .await
            .unwrap();
        let events = Arc::new(EventStream::new("alpha", 100));

        let server = ControlServer::bind(
            "alpha",
            &resolver,
            Arc::new(StaticPeers),
            metrics,
            events.clone(),
        )
        .await
        .unwrap();
        let path = server.socket_path().to_path_buf();
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.serve());

        Harness {
            _dir: dir,
            path,
            events,
            shutdown,
            task,
        }
    }

    async fn request(path: &Path, line: &str) -> Value {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.ends_with('\n'));
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let harness = start_server().await;
        let response = request(&harness.path, "{\"cmd\":\"health\"}\n").await;
        assert_eq!(response, json!({"status": "ready"}));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_command_does_not_desync() {
        let harness = start_server().await;

        let response = request(&harness.path, "{\"cmd\":\"bogus\"}\n").await;
        assert_eq!(response, json!({"error": "Unknown command: bogus"}));

        let response = request(&harness.path, "garbage\n").await;
        assert!(response["error"].is_string());

        let response = request(&harness.path, "{\"cmd\":\"health\"}\n").await;
        assert_eq!(response, json!({"status": "ready"}));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let harness = start_server().await;

        let mut stream = UnixStream::connect(&harness.path).await.unwrap();
        let oversized = vec![b'a'; MAX_REQUEST_LINE + 10];
        stream.write_all(&oversized).await.unwrap();
        let mut response = String::new();
        BufReader::new(stream).read_line(&mut response).await.unwrap();
        let response: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(
            response,
            json!({"error": format!("Request exceeds {} bytes", MAX_REQUEST_LINE)})
        );

        let response = request(&harness.path, "{\"cmd\":\"health\"}\n").await;
        assert_eq!(response, json!({"status": "ready"}));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connect() {
        let harness = start_server().await;

        let ok = request(
            &harness.path,
            "{\"cmd\":\"connect\",\"target\":\"beta\",\"endpoint\":\"http://localhost:8002/mcp\"}\n",
        )
        .await;
        assert_eq!(ok, json!({"status": "connected"}));

        let failed = request(
            &harness.path,
            "{\"cmd\":\"connect\",\"target\":\"gamma\",\"endpoint\":\"http://localhost:8003/mcp\"}\n",
        )
        .await;
        assert_eq!(failed, json!({"status": "failed"}));

        let history = harness.events.history(None).await;
        assert!(
            history
                .iter()
                .any(|e| e.event_type == EventType::PeerConnected && e.data["peer"] == "beta")
        );
        assert!(
            history
                .iter()
                .any(|e| e.event_type == EventType::PeerConnectFailed && e.data["peer"] == "gamma")
        );
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_metrics() {
        let harness = start_server().await;
        request(&harness.path, "{\"cmd\":\"health\"}\n").await;

        let response = request(&harness.path, "{\"cmd\":\"metrics\"}\n").await;
        let counters = &response["metrics"]["counters"];
        assert_eq!(
            counters["node_control_commands_total{command=\"health\",node=\"alpha\"}"]["value"],
            1.0
        );

        let response = request(
            &harness.path,
            "{\"cmd\":\"metrics\",\"format\":\"prometheus\"}\n",
        )
        .await;
        let text = response["metrics"].as_str().unwrap();
        assert!(text.contains("# TYPE node_control_commands_total counter"));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let harness = start_server().await;
        assert!(harness.path.exists());

        let response = request(&harness.path, "{\"cmd\":\"shutdown\"}\n").await;
        assert_eq!(response, json!({"status": "shutting_down"}));

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!harness.path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SocketDir::new(dir.path());
        std::fs::write(resolver.socket_path("alpha"), b"stale").unwrap();

        let metrics = NodeMetrics::new("alpha", Arc::new(MetricsCollector::new()))
            .await
            .unwrap();
        let server = ControlServer::bind(
            "alpha",
            &resolver,
            Arc::new(StaticPeers),
            metrics,
            Arc::new(EventStream::new("alpha", 10)),
        )
        .await;
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_events() {
        let harness = start_server().await;

        let stream = UnixStream::connect(&harness.path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(b"{\"cmd\":\"subscribe_events\"}\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(reader).lines();

        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, json!({"status": "subscribed"}));

        harness
            .events
            .emit(EventType::NodeStarted, json!({"port": 8001}))
            .await;

        let next = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_str(&next).unwrap();
        assert_eq!(event["event"]["event_type"], "node_started");
        assert_eq!(event["event"]["node"], "alpha");

        // Disconnecting unsubscribes
        drop(writer);
        drop(lines);
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.events.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        harness.shutdown.cancel();
    }
}
