//! Node address registry and topology bookkeeping

use crate::client::SocketClient;
use crate::error::{Result, SupervisorError};
use conclave_core::control::{ResponseStatus, node_endpoint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Directed topology edge: `from` was told to treat `to` as a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Wires nodes together by sending `connect` commands and records the result.
///
/// Edges are bookkeeping only; the node process holds the real peer state.
#[derive(Debug)]
pub struct ConnectionManager {
    client: SocketClient,
    registry: RwLock<HashMap<String, String>>,
    edges: RwLock<BTreeSet<Edge>>,
}

impl ConnectionManager {
    pub fn new(client: SocketClient) -> Self {
        Self {
            client,
            registry: RwLock::new(HashMap::new()),
            edges: RwLock::new(BTreeSet::new()),
        }
    }

    /// Record `name`'s listen address, replacing any previous one
    pub async fn register_node(&self, name: &str, port: u16) {
        self.registry
            .write()
            .await
            .insert(name.to_string(), node_endpoint(port));
    }

    /// Forget `name` and every edge touching it
    pub async fn unregister_node(&self, name: &str) {
        self.registry.write().await.remove(name);
        self.edges
            .write()
            .await
            .retain(|edge| edge.from != name && edge.to != name);
    }

    /// Registered endpoint of `name`
    pub async fn endpoint(&self, name: &str) -> Option<String> {
        self.registry.read().await.get(name).cloned()
    }

    /// Tell `from` to connect to `to` and record the edge on success.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` if `to` is not registered; `ConnectFailed` if the command
    /// fails or `from` reports `failed`. No edge is recorded on error.
    pub async fn connect(&self, from: &str, to: &str) -> Result<()> {
        let endpoint = self
            .endpoint(to)
            .await
            .ok_or_else(|| SupervisorError::NodeNotFound(to.to_string()))?;

        let failed = |message: String| SupervisorError::ConnectFailed {
            from: from.to_string(),
            to: to.to_string(),
            message,
        };

        match self.client.connect(from, to, &endpoint).await {
            Ok(ResponseStatus::Connected) => {
                self.edges.write().await.insert(Edge::new(from, to));
                info!("Connected {} -> {} ({})", from, to, endpoint);
                Ok(())
            }
            Ok(status) => {
                warn!("Node {} refused connection to {}: {:?}", from, to, status);
                Err(failed(format!("node answered {:?}", status)))
            }
            Err(e) => {
                warn!("Connect {} -> {} failed: {}", from, to, e);
                Err(failed(e.to_string()))
            }
        }
    }

    /// Established edges in sorted order
    pub async fn connections(&self) -> Vec<Edge> {
        self.edges.read().await.iter().cloned().collect()
    }

    pub async fn is_connected(&self, from: &str, to: &str) -> bool {
        self.edges.read().await.contains(&Edge::new(from, to))
    }
}
