//! # Conclave Core - Control Plane for Supervised Node Fleets
//!
//! Shared building blocks used by both sides of a Conclave fleet:
//! - Fleet and node configuration (figment-based loading)
//! - The line-delimited JSON control-socket protocol and its node-side server
//! - Address resolution for per-node control sockets
//! - Counters, gauges and histograms with JSON and Prometheus export
//! - Node event streams for real-time observability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conclave_core::prelude::*;
//! use std::sync::Arc;
//!
//! struct Peers;
//!
//! #[async_trait::async_trait]
//! impl NodeHandler for Peers {
//!     async fn connect_peer(&self, _target: &str, _endpoint: &str) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let metrics = NodeMetrics::new("alpha", Arc::new(MetricsCollector::new())).await?;
//!     let events = Arc::new(EventStream::new("alpha", DEFAULT_HISTORY_SIZE));
//!
//!     let server = ControlServer::bind(
//!         "alpha",
//!         &SocketDir::default(),
//!         Arc::new(Peers),
//!         metrics,
//!         events,
//!     )
//!     .await?;
//!     server.serve().await
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod metrics;

pub use error::{ConclaveError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        ConclaveConfig, ConfigBuilder, HealthConfig, NodeConfig, RecoveryMode, SupervisorConfig,
    };
    pub use crate::control::{
        AddressResolver, ControlCommand, ControlResponse, ControlServer, NodeHandler,
        ResponseStatus, SocketDir, node_endpoint,
    };
    pub use crate::error::{ConclaveError, Result};
    pub use crate::events::{DEFAULT_HISTORY_SIZE, EventStream, EventType, NodeEvent};
    pub use crate::metrics::{
        FleetMetrics, Labels, MetricKind, MetricsCollector, MetricsFormat, NodeMetrics, labels,
    };
}
