//! Control-socket client
//!
//! Opens one connection per command, writes one line and reads one line back.
//! The timeout covers the whole exchange.

use crate::error::ClientError;
use conclave_core::control::{AddressResolver, ControlCommand, ControlResponse, ResponseStatus};
use conclave_core::events::NodeEvent;
use conclave_core::metrics::MetricsFormat;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

type ClientResult<T> = std::result::Result<T, ClientError>;

/// Sends control commands to nodes by name
#[derive(Debug, Clone)]
pub struct SocketClient {
    resolver: Arc<dyn AddressResolver>,
    timeout: Duration,
}

impl SocketClient {
    /// Create a client resolving sockets through `resolver`
    pub fn new(resolver: Arc<dyn AddressResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Copy of this client with a different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            resolver: self.resolver.clone(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Control socket path of `node`
    pub fn socket_path(&self, node: &str) -> PathBuf {
        self.resolver.socket_path(node)
    }

    /// Send one command and read one response
    pub async fn send_command(
        &self,
        node: &str,
        command: &ControlCommand,
    ) -> ClientResult<ControlResponse> {
        let path = self.existing_socket(node)?;
        debug!("Sending {} to node {}", command.name(), node);

        tokio::time::timeout(self.timeout, exchange(node, &path, command))
            .await
            .map_err(|_| ClientError::Timeout {
                node: node.to_string(),
                timeout: self.timeout,
            })?
    }

    /// Probe liveness; succeeds only on `{"status":"ready"}`
    pub async fn health_check(&self, node: &str) -> ClientResult<()> {
        let response = self.send_command(node, &ControlCommand::Health).await?;
        match expect_status(node, response)? {
            ResponseStatus::Ready => Ok(()),
            other => Err(unexpected(node, format!("health answered {:?}", other))),
        }
    }

    /// Ask `node` to add `target` as a peer; returns `Connected` or `Failed`
    pub async fn connect(
        &self,
        node: &str,
        target: &str,
        endpoint: &str,
    ) -> ClientResult<ResponseStatus> {
        let command = ControlCommand::Connect {
            target: target.to_string(),
            endpoint: endpoint.to_string(),
        };
        let response = self.send_command(node, &command).await?;
        expect_status(node, response)
    }

    /// Ask `node` to exit
    pub async fn shutdown(&self, node: &str) -> ClientResult<()> {
        let response = self.send_command(node, &ControlCommand::Shutdown).await?;
        match expect_status(node, response)? {
            ResponseStatus::ShuttingDown => Ok(()),
            other => Err(unexpected(node, format!("shutdown answered {:?}", other))),
        }
    }

    /// Fetch `node`'s metrics export
    pub async fn metrics(&self, node: &str, format: MetricsFormat) -> ClientResult<Value> {
        match self
            .send_command(node, &ControlCommand::Metrics { format })
            .await?
        {
            ControlResponse::Metrics { metrics } => Ok(metrics),
            ControlResponse::Error { error } => Err(unexpected(node, error)),
            other => Err(unexpected(node, format!("unexpected response {:?}", other))),
        }
    }

    /// Open an event stream; the timeout covers the handshake only
    pub async fn subscribe_events(&self, node: &str) -> ClientResult<EventSubscription> {
        let path = self.existing_socket(node)?;

        let handshake = async {
            let stream = UnixStream::connect(&path).await.map_err(io_error(node))?;
            let (reader, mut writer) = stream.into_split();
            let line = ControlCommand::SubscribeEvents
                .to_line()
                .map_err(|e| unexpected(node, e.to_string()))?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(io_error(node))?;
            writer.flush().await.map_err(io_error(node))?;

            let mut lines = LinesStream::new(BufReader::new(reader).lines());
            let response = read_response(node, &mut lines).await?;
            match expect_status(node, response)? {
                ResponseStatus::Subscribed => Ok(EventSubscription {
                    node: node.to_string(),
                    lines,
                    _writer: writer,
                }),
                other => Err(unexpected(
                    node,
                    format!("subscribe_events answered {:?}", other),
                )),
            }
        };

        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| ClientError::Timeout {
                node: node.to_string(),
                timeout: self.timeout,
            })?
    }

    fn existing_socket(&self, node: &str) -> ClientResult<PathBuf> {
        let path = self.socket_path(node);
        if !path.exists() {
            return Err(ClientError::SocketMissing {
                node: node.to_string(),
                path,
            });
        }
        Ok(path)
    }
}

/// Live event stream from one node. Dropping it unsubscribes.
pub struct EventSubscription {
    node: String,
    lines: LinesStream<BufReader<OwnedReadHalf>>,
    // Closing the write half would end the subscription
    _writer: OwnedWriteHalf,
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("node", &self.node)
            .finish()
    }
}

impl EventSubscription {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Next event, or `None` once the node closes the stream
    pub async fn next_event(&mut self) -> Option<ClientResult<NodeEvent>> {
        loop {
            let line = match self.lines.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(io_error(&self.node)(e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(match ControlResponse::parse(&line) {
                Ok(ControlResponse::Event { event }) => Ok(event),
                Ok(ControlResponse::Error { error }) => Err(unexpected(&self.node, error)),
                Ok(other) => Err(unexpected(
                    &self.node,
                    format!("unexpected response {:?}", other),
                )),
                Err(e) => Err(unexpected(&self.node, e.to_string())),
            });
        }
    }
}

async fn exchange(node: &str, path: &Path, command: &ControlCommand) -> ClientResult<ControlResponse> {
    let stream = UnixStream::connect(path).await.map_err(io_error(node))?;
    let (reader, mut writer) = stream.into_split();

    let line = command
        .to_line()
        .map_err(|e| unexpected(node, e.to_string()))?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(io_error(node))?;
    writer.flush().await.map_err(io_error(node))?;

    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    read_response(node, &mut lines).await
}

async fn read_response(
    node: &str,
    lines: &mut LinesStream<BufReader<OwnedReadHalf>>,
) -> ClientResult<ControlResponse> {
    match lines.next().await {
        Some(Ok(line)) => {
            ControlResponse::parse(&line).map_err(|e| unexpected(node, e.to_string()))
        }
        Some(Err(e)) => Err(io_error(node)(e)),
        None => Err(ClientError::Closed {
            node: node.to_string(),
        }),
    }
}

fn expect_status(node: &str, response: ControlResponse) -> ClientResult<ResponseStatus> {
    match response {
        ControlResponse::Status { status } => Ok(status),
        ControlResponse::Error { error } => Err(unexpected(node, error)),
        other => Err(unexpected(node, format!("unexpected response {:?}", other))),
    }
}

fn unexpected(node: &str, message: impl Into<String>) -> ClientError {
    ClientError::Protocol {
        node: node.to_string(),
        message: message.into(),
    }
}

fn io_error(node: &str) -> impl Fn(std::io::Error) -> ClientError + '_ {
    move |source| ClientError::Io {
        node: node.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::control::SocketDir;
    use tokio::net::UnixListener;

    /// Serve a single canned reply on `node`'s socket
    async fn canned(dir: &Path, node: &str, reply: Option<&'static str>) -> SocketClient {
        let resolver = SocketDir::new(dir);
        let listener = UnixListener::bind(resolver.socket_path(node)).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            match reply {
                Some(reply) => writer.write_all(reply.as_bytes()).await.unwrap(),
                // Hold the connection open without answering
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
        });
        SocketClient::new(Arc::new(resolver), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_health_check_ready() {
        let dir = tempfile::tempdir().unwrap();
        let client = canned(dir.path(), "alpha", Some("{\"status\":\"ready\"}\n")).await;
        client.health_check("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = SocketClient::new(
            Arc::new(SocketDir::new(dir.path())),
            Duration::from_millis(300),
        );
        let err = client.health_check("ghost").await.unwrap_err();
        assert!(matches!(err, ClientError::SocketMissing { .. }));
        assert_eq!(err.node(), "ghost");
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let client = canned(dir.path(), "alpha", None).await;
        let err = client.health_check("alpha").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = canned(
            dir.path(),
            "alpha",
            Some("{\"error\":\"Unknown command: metrics\"}\n"),
        )
        .await;
        let err = client
            .metrics("alpha", MetricsFormat::Json)
            .await
            .unwrap_err();
        match err {
            ClientError::Protocol { message, .. } => {
                assert_eq!(message, "Unknown command: metrics")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let client = canned(dir.path(), "alpha", Some("")).await;
        let err = client.shutdown("alpha").await.unwrap_err();
        assert!(matches!(err, ClientError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_connect_failed_status() {
        let dir = tempfile::tempdir().unwrap();
        let client = canned(dir.path(), "alpha", Some("{\"status\":\"failed\"}\n")).await;
        let status = client
            .connect("alpha", "beta", "http://localhost:8002/mcp")
            .await
            .unwrap();
        assert_eq!(status, ResponseStatus::Failed);
    }
}
