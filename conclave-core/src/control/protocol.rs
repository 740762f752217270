//! Control-socket wire protocol
//!
//! Newline-delimited JSON, one object per line in both directions. A request is
//! `{"cmd": "<name>", ...fields}`; a response carries exactly one of `status`,
//! `metrics`, `event` or `error`.

use crate::error::{ConclaveError, Result};
use crate::events::NodeEvent;
use crate::metrics::MetricsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command names understood by the control server
pub const COMMAND_NAMES: &[&str] = &["health", "connect", "shutdown", "metrics", "subscribe_events"];

/// A control command sent to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness probe
    Health,
    /// Add `target` at `endpoint` to the node's peers
    Connect { target: String, endpoint: String },
    /// Ask the node to exit
    Shutdown,
    /// Export the node's metrics
    Metrics {
        #[serde(default)]
        format: MetricsFormat,
    },
    /// Turn the connection into an event stream
    SubscribeEvents,
}

impl ControlCommand {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Health => "health",
            ControlCommand::Connect { .. } => "connect",
            ControlCommand::Shutdown => "shutdown",
            ControlCommand::Metrics { .. } => "metrics",
            ControlCommand::SubscribeEvents => "subscribe_events",
        }
    }

    /// Parse one request line.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed JSON, a missing `cmd`, an unknown
    /// command (`Unknown command: <cmd>`) or invalid fields.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| ConclaveError::Protocol(format!("Invalid JSON: {}", e)))?;

        let cmd = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| ConclaveError::Protocol("Missing cmd field".to_string()))?;

        if !COMMAND_NAMES.contains(&cmd) {
            return Err(ConclaveError::Protocol(format!("Unknown command: {}", cmd)));
        }

        serde_json::from_value(value.clone())
            .map_err(|e| ConclaveError::Protocol(format!("Invalid {} command: {}", cmd, e)))
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        encode_line(self)
    }
}

/// Value of a `status` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ready,
    Connected,
    Failed,
    ShuttingDown,
    Subscribed,
}

/// A response line from a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Status { status: ResponseStatus },
    Metrics { metrics: Value },
    Event { event: NodeEvent },
    Error { error: String },
}

impl ControlResponse {
    pub fn status(status: ResponseStatus) -> Self {
        ControlResponse::Status { status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            error: message.into(),
        }
    }

    /// Error response for a failed request; protocol errors carry their bare message
    pub fn from_error(err: &ConclaveError) -> Self {
        match err {
            ConclaveError::Protocol(message) => Self::error(message.clone()),
            other => Self::error(other.to_string()),
        }
    }

    /// Status carried by the response, if any
    pub fn status_value(&self) -> Option<ResponseStatus> {
        match self {
            ControlResponse::Status { status } => Some(*status),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlResponse::Error { .. })
    }

    /// Parse one response line
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| ConclaveError::Protocol(format!("Invalid response: {}", e)))
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        encode_line(self)
    }
}

fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}
