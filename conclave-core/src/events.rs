//! Node event stream for real-time observability
//!
//! Each node owns an [`EventStream`]. Events are kept in a bounded history and fanned
//! out to every live subscriber; the control socket's `subscribe_events` command
//! forwards them to external observers.
//!
//! # Example
//!
//! ```rust,ignore
//! let stream = EventStream::new("alpha", 1000);
//! let mut rx = stream.subscribe();
//!
//! stream.emit(EventType::PeerConnected, json!({"peer": "beta"})).await;
//! let event = rx.recv().await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::{RwLock, broadcast};

/// Default number of events retained in history
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

const CHANNEL_CAPACITY: usize = 256;

/// Kinds of events a node emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Node finished startup and its control socket is listening
    NodeStarted,
    /// Node is shutting down
    NodeStopped,
    /// A peer connection was added
    PeerConnected,
    /// A peer connection could not be added
    PeerConnectFailed,
    /// A control command was handled
    ControlCommand,
    /// Something went wrong inside the node
    Error,
}

/// Structured event emitted by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Unique event ID
    pub id: String,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Emitting node
    pub node: String,
    /// Event kind
    pub event_type: EventType,
    /// Event payload
    pub data: Value,
    /// Links related events together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl NodeEvent {
    /// Create an event stamped with the current time
    pub fn new(node: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            node: node.into(),
            event_type,
            data,
            correlation_id: None,
        }
    }

    /// Attach a correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Event emission and subscription for one node
#[derive(Debug)]
pub struct EventStream {
    node: String,
    history: RwLock<VecDeque<NodeEvent>>,
    history_size: usize,
    sender: broadcast::Sender<NodeEvent>,
}

impl EventStream {
    /// Create a stream for `node` keeping at most `history_size` past events
    pub fn new(node: impl Into<String>, history_size: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            node: node.into(),
            history: RwLock::new(VecDeque::with_capacity(history_size.min(CHANNEL_CAPACITY))),
            history_size,
            sender,
        }
    }

    /// Name of the node this stream belongs to
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Emit an event to history and all subscribers
    pub async fn emit(&self, event_type: EventType, data: Value) -> NodeEvent {
        let event = NodeEvent::new(self.node.clone(), event_type, data);
        self.publish(event.clone()).await;
        event
    }

    /// Publish a pre-built event
    pub async fn publish(&self, event: NodeEvent) {
        {
            let mut history = self.history.write().await;
            if self.history_size > 0 {
                if history.len() == self.history_size {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Recent events, oldest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<NodeEvent> {
        let history = self.history.read().await;
        let skip = limit
            .map(|limit| history.len().saturating_sub(limit))
            .unwrap_or(0);
        history.iter().skip(skip).cloned().collect()
    }

    /// Drop all retained events
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }
}
