//! JSON and Prometheus text exporters

use crate::metrics::collector::{MetricKind, MetricsCollector, label_string};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Fixed histogram bucket upper bounds (seconds-oriented, like Prometheus defaults)
pub const HISTOGRAM_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Export format accepted by the `metrics` control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// Structured JSON object
    #[default]
    Json,
    /// Prometheus text exposition format
    Prometheus,
}

/// Derived statistics of one histogram series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    /// Cumulative counts per bucket bound, `+Inf` excluded
    #[serde(skip)]
    pub buckets: Vec<(f64, usize)>,
}

impl HistogramSummary {
    /// Summarize raw observations; `None` when there are none
    pub fn from_observations(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let buckets = HISTOGRAM_BUCKETS
            .iter()
            .map(|bound| (*bound, sorted.iter().filter(|v| **v <= *bound).count()))
            .collect();

        Some(Self {
            count,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            avg: sum / count as f64,
            p50: sorted[count / 2],
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            buckets,
        })
    }

    fn to_json(&self) -> Value {
        let buckets: Map<String, Value> = self
            .buckets
            .iter()
            .map(|(bound, count)| (format_bound(*bound), json!(count)))
            .chain(std::iter::once(("+Inf".to_string(), json!(self.count))))
            .collect();

        json!({
            "count": self.count,
            "sum": self.sum,
            "min": self.min,
            "max": self.max,
            "avg": self.avg,
            "p50": self.p50,
            "p95": self.p95,
            "p99": self.p99,
            "buckets": buckets,
        })
    }
}

/// Nearest-rank percentile over already-sorted values
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let index = ((sorted.len() as f64) * quantile) as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn format_bound(bound: f64) -> String {
    format!("{}", bound)
}

impl MetricsCollector {
    /// Export in the requested format: an object for JSON, a string for Prometheus
    pub async fn export(&self, format: MetricsFormat) -> Value {
        match format {
            MetricsFormat::Json => self.export_json().await,
            MetricsFormat::Prometheus => Value::String(self.export_prometheus().await),
        }
    }

    /// Export all series as `{counters, gauges, histograms}` keyed by series key
    pub async fn export_json(&self) -> Value {
        let families = self.families.read().await;
        let mut counters = Map::new();
        let mut gauges = Map::new();
        let mut histograms = Map::new();

        for family in families.values() {
            match family.kind {
                MetricKind::Counter | MetricKind::Gauge => {
                    let target = if family.kind == MetricKind::Counter {
                        &mut counters
                    } else {
                        &mut gauges
                    };
                    for (key, value) in &family.values {
                        target.insert(
                            key.clone(),
                            json!({
                                "value": value.value,
                                "timestamp": value.timestamp,
                                "labels": value.labels,
                            }),
                        );
                    }
                }
                MetricKind::Histogram => {
                    for (key, observations) in &family.observations {
                        if let Some(summary) =
                            HistogramSummary::from_observations(&observations.values)
                        {
                            histograms.insert(key.clone(), summary.to_json());
                        }
                    }
                }
            }
        }

        json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Export all registered metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let families = self.families.read().await;
        let mut lines = Vec::new();

        for (name, family) in families.iter() {
            lines.push(format!("# HELP {} {}", name, family.help));
            lines.push(format!("# TYPE {} {}", name, family.kind));

            match family.kind {
                MetricKind::Counter | MetricKind::Gauge => {
                    for (key, value) in &family.values {
                        lines.push(format!("{} {}", key, value.value));
                    }
                }
                MetricKind::Histogram => {
                    for observations in family.observations.values() {
                        let Some(summary) =
                            HistogramSummary::from_observations(&observations.values)
                        else {
                            continue;
                        };

                        let extra = if observations.labels.is_empty() {
                            String::new()
                        } else {
                            format!(",{}", label_string(&observations.labels))
                        };
                        let plain = if observations.labels.is_empty() {
                            String::new()
                        } else {
                            format!("{{{}}}", label_string(&observations.labels))
                        };

                        for (bound, count) in &summary.buckets {
                            lines.push(format!(
                                "{}_bucket{{le=\"{}\"{}}} {}",
                                name,
                                format_bound(*bound),
                                extra,
                                count
                            ));
                        }
                        lines.push(format!(
                            "{}_bucket{{le=\"+Inf\"{}}} {}",
                            name, extra, summary.count
                        ));
                        lines.push(format!("{}_sum{} {}", name, plain, summary.sum));
                        lines.push(format!("{}_count{} {}", name, plain, summary.count));
                    }
                }
            }

            lines.push(String::new());
        }

        lines.join("\n")
    }
}
