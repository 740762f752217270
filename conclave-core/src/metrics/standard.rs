//! Standard metric sets for the supervisor and for nodes

use crate::error::Result;
use crate::metrics::collector::{MetricKind, MetricsCollector, labels};
use std::sync::Arc;
use std::time::Duration;

/// Fleet-level metrics recorded by the supervisor
#[derive(Debug, Clone)]
pub struct FleetMetrics {
    collector: Arc<MetricsCollector>,
}

impl FleetMetrics {
    pub const NODE_UP: &'static str = "conclave_node_up";
    pub const NODE_START_TIME: &'static str = "conclave_node_start_time_seconds";
    pub const NODE_RESTARTS: &'static str = "conclave_node_restarts_total";
    pub const HEALTH_CHECK_DURATION: &'static str = "conclave_health_check_duration_seconds";
    pub const HEALTH_CHECK_FAILURES: &'static str = "conclave_health_check_failures_total";
    pub const CONNECTIONS: &'static str = "conclave_connections_total";
    pub const CONNECTION_ERRORS: &'static str = "conclave_connection_errors_total";

    /// Register the fleet metrics on `collector`
    pub async fn new(collector: Arc<MetricsCollector>) -> Result<Self> {
        let definitions = [
            (Self::NODE_UP, MetricKind::Gauge, "Whether the node is up (1) or down (0)"),
            (Self::NODE_START_TIME, MetricKind::Gauge, "Unix timestamp when the node was last started"),
            (Self::NODE_RESTARTS, MetricKind::Counter, "Total number of automatic node restarts"),
            (Self::HEALTH_CHECK_DURATION, MetricKind::Histogram, "Duration of health checks in seconds"),
            (Self::HEALTH_CHECK_FAILURES, MetricKind::Counter, "Total number of failed health checks"),
            (Self::CONNECTIONS, MetricKind::Counter, "Total number of topology edges established"),
            (Self::CONNECTION_ERRORS, MetricKind::Counter, "Total number of failed connect attempts"),
        ];
        for (name, kind, help) in definitions {
            collector.register_metric(name, kind, help).await?;
        }
        Ok(Self { collector })
    }

    /// Underlying collector
    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub async fn set_node_up(&self, node: &str, up: bool) -> Result<()> {
        self.collector
            .set_gauge(
                Self::NODE_UP,
                if up { 1.0 } else { 0.0 },
                Some(labels([("node", node)])),
            )
            .await
    }

    pub async fn set_node_start_time(&self, node: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.collector
            .set_gauge(Self::NODE_START_TIME, now, Some(labels([("node", node)])))
            .await
    }

    /// Count an automatic restart; `reason` is `crash` or `health`
    pub async fn inc_restarts(&self, node: &str, reason: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::NODE_RESTARTS,
                1.0,
                Some(labels([("node", node), ("reason", reason)])),
            )
            .await
    }

    pub async fn observe_health_check(&self, node: &str, duration: Duration) -> Result<()> {
        self.collector
            .observe_histogram(
                Self::HEALTH_CHECK_DURATION,
                duration.as_secs_f64(),
                Some(labels([("node", node)])),
            )
            .await
    }

    pub async fn inc_health_check_failures(&self, node: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::HEALTH_CHECK_FAILURES,
                1.0,
                Some(labels([("node", node)])),
            )
            .await
    }

    pub async fn inc_connections(&self, from: &str, to: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::CONNECTIONS,
                1.0,
                Some(labels([("from", from), ("to", to)])),
            )
            .await
    }

    pub async fn inc_connection_errors(&self, from: &str, to: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::CONNECTION_ERRORS,
                1.0,
                Some(labels([("from", from), ("to", to)])),
            )
            .await
    }
}

/// Metrics a node records about itself
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    node: String,
    collector: Arc<MetricsCollector>,
}

impl NodeMetrics {
    pub const UP: &'static str = "node_up";
    pub const START_TIME: &'static str = "node_start_time_seconds";
    pub const CONNECTIONS_ACTIVE: &'static str = "node_connections_active";
    pub const CONNECTIONS: &'static str = "node_connections_total";
    pub const CONNECTION_ERRORS: &'static str = "node_connection_errors_total";
    pub const CONTROL_COMMANDS: &'static str = "node_control_commands_total";

    /// Register the node metrics on `collector`
    pub async fn new(node: impl Into<String>, collector: Arc<MetricsCollector>) -> Result<Self> {
        let definitions = [
            (Self::UP, MetricKind::Gauge, "Whether the node is up (1) or down (0)"),
            (Self::START_TIME, MetricKind::Gauge, "Unix timestamp when the node started"),
            (Self::CONNECTIONS_ACTIVE, MetricKind::Gauge, "Number of active peer connections"),
            (Self::CONNECTIONS, MetricKind::Counter, "Total number of peer connections established"),
            (Self::CONNECTION_ERRORS, MetricKind::Counter, "Total number of peer connection errors"),
            (Self::CONTROL_COMMANDS, MetricKind::Counter, "Control-socket commands handled"),
        ];
        for (name, kind, help) in definitions {
            collector.register_metric(name, kind, help).await?;
        }
        Ok(Self {
            node: node.into(),
            collector,
        })
    }

    /// Underlying collector
    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Mark the node up and stamp its start time
    pub async fn mark_started(&self) -> Result<()> {
        let node = labels([("node", self.node.as_str())]);
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.collector
            .set_gauge(Self::UP, 1.0, Some(node.clone()))
            .await?;
        self.collector
            .set_gauge(Self::START_TIME, now, Some(node))
            .await
    }

    pub async fn mark_stopped(&self) -> Result<()> {
        self.collector
            .set_gauge(Self::UP, 0.0, Some(labels([("node", self.node.as_str())])))
            .await
    }

    pub async fn set_active_connections(&self, count: usize) -> Result<()> {
        self.collector
            .set_gauge(
                Self::CONNECTIONS_ACTIVE,
                count as f64,
                Some(labels([("node", self.node.as_str())])),
            )
            .await
    }

    pub async fn inc_connections(&self, peer: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::CONNECTIONS,
                1.0,
                Some(labels([("node", self.node.as_str()), ("peer", peer)])),
            )
            .await
    }

    pub async fn inc_connection_errors(&self, peer: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::CONNECTION_ERRORS,
                1.0,
                Some(labels([("node", self.node.as_str()), ("peer", peer)])),
            )
            .await
    }

    pub async fn inc_control_command(&self, command: &str) -> Result<()> {
        self.collector
            .increment_counter(
                Self::CONTROL_COMMANDS,
                1.0,
                Some(labels([("node", self.node.as_str()), ("command", command)])),
            )
            .await
    }
}
