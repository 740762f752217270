//! Tests for metrics collection and export

use crate::metrics::{
    FleetMetrics, HistogramSummary, Labels, MetricKind, MetricsCollector, MetricsFormat, NodeMetrics,
    labels, series_key,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_counter_round_trip() {
    let collector = MetricsCollector::new();
    collector
        .register_metric("x", MetricKind::Counter, "Test counter")
        .await
        .unwrap();

    let series = labels([("a", "1")]);
    collector
        .increment_counter("x", 1.0, Some(series.clone()))
        .await
        .unwrap();
    collector
        .increment_counter("x", 1.0, Some(series.clone()))
        .await
        .unwrap();

    let json = collector.export_json().await;
    assert_eq!(json["counters"]["x{a=\"1\"}"]["value"], 2.0);
    assert_eq!(json["counters"]["x{a=\"1\"}"]["labels"]["a"], "1");
    assert_eq!(collector.value("x", Some(&series)).await, Some(2.0));

    let text = collector.export_prometheus().await;
    assert!(text.contains("# TYPE x counter"));
    assert!(text.contains("# HELP x Test counter"));
    assert!(text.contains("x{a=\"1\"} 2"));
}

#[test]
fn test_series_key_sorts_labels() {
    let key = series_key("requests", &labels([("z", "2"), ("a", "1")]));
    assert_eq!(key, "requests{a=\"1\",z=\"2\"}");
    assert_eq!(series_key("requests", &Labels::new()), "requests");
}

#[tokio::test]
async fn test_label_sets_are_separate_series() {
    let collector = MetricsCollector::new();
    collector
        .increment_counter("hits", 1.0, Some(labels([("node", "a")])))
        .await
        .unwrap();
    collector
        .increment_counter("hits", 3.0, Some(labels([("node", "b")])))
        .await
        .unwrap();
    collector.increment_counter("hits", 5.0, None).await.unwrap();

    assert_eq!(
        collector.value("hits", Some(&labels([("node", "a")]))).await,
        Some(1.0)
    );
    assert_eq!(
        collector.value("hits", Some(&labels([("node", "b")]))).await,
        Some(3.0)
    );
    assert_eq!(collector.value("hits", None).await, Some(5.0));
}

#[tokio::test]
async fn test_gauge_last_write_wins() {
    let collector = MetricsCollector::new();
    collector.set_gauge("temp", 10.0, None).await.unwrap();
    collector.set_gauge("temp", 4.5, None).await.unwrap();
    collector.set_gauge("temp", -1.0, None).await.unwrap();

    assert_eq!(collector.value("temp", None).await, Some(-1.0));
    // Unregistered names are auto-registered
    assert_eq!(collector.kind_of("temp").await, Some(MetricKind::Gauge));

    let json = collector.export_json().await;
    assert_eq!(json["gauges"]["temp"]["value"], -1.0);
}

#[tokio::test]
async fn test_kind_mismatch_rejected() {
    let collector = MetricsCollector::new();
    collector
        .register_metric("up", MetricKind::Gauge, "Up")
        .await
        .unwrap();

    assert!(collector.increment_counter("up", 1.0, None).await.is_err());
    assert!(collector.observe_histogram("up", 1.0, None).await.is_err());
    assert!(
        collector
            .register_metric("up", MetricKind::Counter, "Up")
            .await
            .is_err()
    );
    // Same kind only updates help
    assert!(
        collector
            .register_metric("up", MetricKind::Gauge, "Node up")
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_counter_rejects_negative_increment() {
    let collector = MetricsCollector::new();
    assert!(collector.increment_counter("c", -1.0, None).await.is_err());
    assert!(
        collector
            .increment_counter("c", f64::NAN, None)
            .await
            .is_err()
    );
    assert_eq!(collector.value("c", None).await, None);

    assert!(collector.observe_histogram("h", f64::NAN, None).await.is_err());
}

#[test]
fn test_histogram_summary() {
    let values: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
    let summary = HistogramSummary::from_observations(&values).unwrap();

    assert_eq!(summary.count, 100);
    assert!((summary.sum - 50.5).abs() < 1e-9);
    assert_eq!(summary.min, 0.01);
    assert_eq!(summary.max, 1.0);
    assert_eq!(summary.p50, 0.51);
    assert_eq!(summary.p95, 0.96);
    assert_eq!(summary.p99, 1.0);

    let le_01 = summary
        .buckets
        .iter()
        .find(|(bound, _)| *bound == 0.1)
        .map(|(_, count)| *count);
    assert_eq!(le_01, Some(10));

    let single = HistogramSummary::from_observations(&[0.3]).unwrap();
    assert_eq!(single.p50, 0.3);
    assert_eq!(single.p99, 0.3);

    assert!(HistogramSummary::from_observations(&[]).is_none());
}

#[tokio::test]
async fn test_histogram_export() {
    let collector = MetricsCollector::new();
    collector
        .register_metric("latency", MetricKind::Histogram, "Request latency")
        .await
        .unwrap();

    let series = labels([("node", "alpha")]);
    for value in [0.004, 0.02, 0.3, 20.0] {
        collector
            .observe_histogram("latency", value, Some(series.clone()))
            .await
            .unwrap();
    }

    let json = collector.export_json().await;
    let histogram = &json["histograms"]["latency{node=\"alpha\"}"];
    assert_eq!(histogram["count"], 4);
    assert_eq!(histogram["min"], 0.004);
    assert_eq!(histogram["max"], 20.0);
    assert_eq!(histogram["buckets"]["0.005"], 1);
    assert_eq!(histogram["buckets"]["10"], 3);
    assert_eq!(histogram["buckets"]["+Inf"], 4);

    let text = collector.export_prometheus().await;
    assert!(text.contains("# TYPE latency histogram"));
    assert!(text.contains("latency_bucket{le=\"0.025\",node=\"alpha\"} 2"));
    assert!(text.contains("latency_bucket{le=\"+Inf\",node=\"alpha\"} 4"));
    assert!(text.contains("latency_count{node=\"alpha\"} 4"));
    assert!(text.contains("latency_sum{node=\"alpha\"}"));
}

#[tokio::test]
async fn test_export_is_non_destructive() {
    let collector = MetricsCollector::new();
    collector.observe_histogram("h", 1.0, None).await.unwrap();
    collector.increment_counter("c", 1.0, None).await.unwrap();

    let first = collector.export_json().await;
    let _ = collector.export_prometheus().await;
    let second = collector.export_json().await;

    assert_eq!(first["histograms"]["h"]["count"], 1);
    assert_eq!(second["histograms"]["h"]["count"], 1);
    assert_eq!(collector.observation_count("h", None).await, 1);
    assert_eq!(second["counters"]["c"]["value"], 1.0);
}

#[tokio::test]
async fn test_export_format_selection() {
    let collector = MetricsCollector::new();
    collector.set_gauge("g", 1.0, None).await.unwrap();

    assert!(collector.export(MetricsFormat::Json).await.is_object());
    let text = collector.export(MetricsFormat::Prometheus).await;
    assert!(text.as_str().unwrap().contains("g 1"));

    let format: MetricsFormat = serde_json::from_str("\"prometheus\"").unwrap();
    assert_eq!(format, MetricsFormat::Prometheus);
    assert_eq!(MetricsFormat::default(), MetricsFormat::Json);
}

#[tokio::test]
async fn test_label_values_are_escaped() {
    let collector = MetricsCollector::new();
    collector
        .set_gauge("g", 1.0, Some(labels([("path", "a\"b")])))
        .await
        .unwrap();

    let text = collector.export_prometheus().await;
    assert!(text.contains("g{path=\"a\\\"b\"} 1"));
}

#[tokio::test]
async fn test_fleet_metrics() {
    let collector = Arc::new(MetricsCollector::new());
    let fleet = FleetMetrics::new(collector.clone()).await.unwrap();

    fleet.set_node_up("alpha", true).await.unwrap();
    fleet.inc_restarts("alpha", "health").await.unwrap();
    fleet.inc_restarts("alpha", "health").await.unwrap();
    fleet
        .observe_health_check("alpha", Duration::from_millis(12))
        .await
        .unwrap();
    fleet.inc_connections("alpha", "beta").await.unwrap();

    assert_eq!(
        collector
            .value(FleetMetrics::NODE_UP, Some(&labels([("node", "alpha")])))
            .await,
        Some(1.0)
    );
    assert_eq!(
        collector
            .value(
                FleetMetrics::NODE_RESTARTS,
                Some(&labels([("node", "alpha"), ("reason", "health")]))
            )
            .await,
        Some(2.0)
    );
    assert_eq!(
        collector
            .observation_count(
                FleetMetrics::HEALTH_CHECK_DURATION,
                Some(&labels([("node", "alpha")]))
            )
            .await,
        1
    );

    fleet.set_node_up("alpha", false).await.unwrap();
    assert_eq!(
        collector
            .value(FleetMetrics::NODE_UP, Some(&labels([("node", "alpha")])))
            .await,
        Some(0.0)
    );

    // Registered families show up even before they have samples
    let text = collector.export_prometheus().await;
    assert!(text.contains("# TYPE conclave_connection_errors_total counter"));
}

#[tokio::test]
async fn test_node_metrics() {
    let collector = Arc::new(MetricsCollector::new());
    let node = NodeMetrics::new("alpha", collector.clone()).await.unwrap();

    node.mark_started().await.unwrap();
    node.inc_control_command("health").await.unwrap();
    node.inc_control_command("health").await.unwrap();
    node.inc_connections("beta").await.unwrap();
    node.set_active_connections(1).await.unwrap();

    let up = labels([("node", "alpha")]);
    assert_eq!(collector.value(NodeMetrics::UP, Some(&up)).await, Some(1.0));
    assert!(
        collector
            .value(NodeMetrics::START_TIME, Some(&up))
            .await
            .unwrap()
            > 0.0
    );
    assert_eq!(
        collector
            .value(
                NodeMetrics::CONTROL_COMMANDS,
                Some(&labels([("command", "health"), ("node", "alpha")]))
            )
            .await,
        Some(2.0)
    );

    node.mark_stopped().await.unwrap();
    assert_eq!(collector.value(NodeMetrics::UP, Some(&up)).await, Some(0.0));
}
