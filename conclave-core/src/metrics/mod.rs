//! Counter, gauge and histogram collection with JSON and Prometheus export
//!
//! Series are keyed by metric name plus a sorted label string, e.g.
//! `node_control_commands_total{command="health",node="alpha"}`.

pub mod collector;
pub mod export;
pub mod standard;

#[cfg(test)]
mod tests;

pub use collector::{Labels, MetricKind, MetricValue, MetricsCollector, labels, series_key};
pub use export::{HISTOGRAM_BUCKETS, HistogramSummary, MetricsFormat};
pub use standard::{FleetMetrics, NodeMetrics};
