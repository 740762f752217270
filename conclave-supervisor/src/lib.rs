//! Conclave Supervisor - Process supervision for node fleets
//!
//! Runs every node as its own OS process and provides:
//! - **Phased lifecycle control** - staggered spawning, readiness waits, graceful
//!   stop escalating to SIGTERM and SIGKILL
//! - **Health monitoring** - periodic probes with failure-threshold recovery capped
//!   by a per-node restart budget
//! - **Crash watch** - a lighter alternative that only restarts exited processes
//! - **Runtime topology** - `connect` commands wire nodes together after startup
//! - **Control-socket client** - talk to any node's socket directly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conclave_core::config::{NodeConfig, RecoveryMode, SupervisorConfig};
//! use conclave_supervisor::NodeSupervisor;
//!
//! # async fn run() -> conclave_supervisor::Result<()> {
//! let supervisor = NodeSupervisor::new(SupervisorConfig::default()).await?;
//! supervisor.add_node(NodeConfig::new("alpha", 8001)).await?;
//! supervisor.add_node(NodeConfig::new("beta", 8002)).await?;
//!
//! supervisor.start_all(true).await?;
//! supervisor.start_monitoring(RecoveryMode::default()).await;
//! supervisor.connect("alpha", "beta", true).await?;
//!
//! for (name, status) in supervisor.get_status().await {
//!     println!("{}: {}", name, status.status);
//! }
//!
//! supervisor.stop_all().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod health;
mod process;
mod resource;
mod supervisor;

pub use client::{EventSubscription, SocketClient};
pub use connection::{ConnectionManager, Edge};
pub use error::{ClientError, Result, SupervisorError};
pub use health::{HealthStatus, RESTART_WINDOW, RestartBudget};
pub use process::{NodeProcess, NodeStatus, NodeStatusInfo, READY_SENTINEL};
pub use resource::{ResourceSampler, ResourceUsage};
pub use supervisor::{NodeSupervisor, RECOVERY_STOP_TIMEOUT};
