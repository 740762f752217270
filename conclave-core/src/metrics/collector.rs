//! Metrics collector implementation

use crate::error::{ConclaveError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Ordered label set identifying one series of a metric
pub type Labels = BTreeMap<String, String>;

/// Build a label set from key/value pairs
pub fn labels<I, K, V>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Kind of a registered metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically non-decreasing per label set
    Counter,
    /// Last write wins per label set
    Gauge,
    /// Raw observations per label set
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// A single metric value with timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Current value
    pub value: f64,
    /// When the value was last written
    pub timestamp: DateTime<Utc>,
    /// Labels of the series
    pub labels: Labels,
}

/// Observations collected for one histogram series
#[derive(Debug, Clone, Default)]
pub(crate) struct Observations {
    pub(crate) labels: Labels,
    pub(crate) values: Vec<f64>,
}

/// All series of one metric name
#[derive(Debug, Clone)]
pub(crate) struct MetricFamily {
    pub(crate) kind: MetricKind,
    pub(crate) help: String,
    /// Counter and gauge series keyed by series key
    pub(crate) values: BTreeMap<String, MetricValue>,
    /// Histogram series keyed by series key
    pub(crate) observations: BTreeMap<String, Observations>,
}

impl MetricFamily {
    fn new(kind: MetricKind, help: impl Into<String>) -> Self {
        Self {
            kind,
            help: help.into(),
            values: BTreeMap::new(),
            observations: BTreeMap::new(),
        }
    }
}

/// Build the key of a series: `name` or `name{k="v",...}` with sorted labels
pub fn series_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    format!("{}{{{}}}", name, label_string(labels))
}

/// Render labels as `k="v",...` with Prometheus escaping
pub(crate) fn label_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// In-process registry of counters, gauges and histograms
///
/// Each node owns one collector; the supervisor owns a separate one for fleet-level
/// series. Exports (see [`MetricsCollector::export_json`] and
/// [`MetricsCollector::export_prometheus`]) never clear recorded data.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    pub(crate) families: RwLock<BTreeMap<String, MetricFamily>>,
}

impl MetricsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a metric's kind and help text.
    ///
    /// Re-registering with the same kind only updates the help text.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already registered with another kind.
    pub async fn register_metric(
        &self,
        name: &str,
        kind: MetricKind,
        help: impl Into<String>,
    ) -> Result<()> {
        let mut families = self.families.write().await;
        match families.get_mut(name) {
            Some(family) if family.kind != kind => Err(ConclaveError::Metrics(format!(
                "Metric {} already registered as {}",
                name, family.kind
            ))),
            Some(family) => {
                family.help = help.into();
                Ok(())
            }
            None => {
                families.insert(name.to_string(), MetricFamily::new(kind, help));
                Ok(())
            }
        }
    }

    /// Increment a counter series by `value`.
    ///
    /// # Errors
    ///
    /// Returns an error for a negative or non-finite increment, or if `name` is
    /// registered as another kind.
    pub async fn increment_counter(
        &self,
        name: &str,
        value: f64,
        labels: Option<Labels>,
    ) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(ConclaveError::Metrics(format!(
                "Counter {} cannot be incremented by {}",
                name, value
            )));
        }

        let labels = labels.unwrap_or_default();
        let key = series_key(name, &labels);
        let mut families = self.families.write().await;
        let family = Self::family_for(&mut families, name, MetricKind::Counter)?;

        let now = Utc::now();
        family
            .values
            .entry(key)
            .and_modify(|current| {
                current.value += value;
                current.timestamp = now;
            })
            .or_insert(MetricValue {
                value,
                timestamp: now,
                labels,
            });
        Ok(())
    }

    /// Set a gauge series.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is registered as another kind.
    pub async fn set_gauge(&self, name: &str, value: f64, labels: Option<Labels>) -> Result<()> {
        let labels = labels.unwrap_or_default();
        let key = series_key(name, &labels);
        let mut families = self.families.write().await;
        let family = Self::family_for(&mut families, name, MetricKind::Gauge)?;

        family.values.insert(
            key,
            MetricValue {
                value,
                timestamp: Utc::now(),
                labels,
            },
        );
        Ok(())
    }

    /// Record one histogram observation.
    ///
    /// # Errors
    ///
    /// Returns an error for a NaN observation, or if `name` is registered as another kind.
    pub async fn observe_histogram(
        &self,
        name: &str,
        value: f64,
        labels: Option<Labels>,
    ) -> Result<()> {
        if value.is_nan() {
            return Err(ConclaveError::Metrics(format!(
                "Histogram {} cannot observe NaN",
                name
            )));
        }

        let labels = labels.unwrap_or_default();
        let key = series_key(name, &labels);
        let mut families = self.families.write().await;
        let family = Self::family_for(&mut families, name, MetricKind::Histogram)?;

        family
            .observations
            .entry(key)
            .or_insert_with(|| Observations {
                labels,
                values: Vec::new(),
            })
            .values
            .push(value);
        Ok(())
    }

    /// Current value of a counter or gauge series
    pub async fn value(&self, name: &str, labels: Option<&Labels>) -> Option<f64> {
        let key = match labels {
            Some(labels) => series_key(name, labels),
            None => name.to_string(),
        };
        let families = self.families.read().await;
        families
            .get(name)
            .and_then(|family| family.values.get(&key))
            .map(|v| v.value)
    }

    /// Number of observations recorded for a histogram series
    pub async fn observation_count(&self, name: &str, labels: Option<&Labels>) -> usize {
        let key = match labels {
            Some(labels) => series_key(name, labels),
            None => name.to_string(),
        };
        let families = self.families.read().await;
        families
            .get(name)
            .and_then(|family| family.observations.get(&key))
            .map(|o| o.values.len())
            .unwrap_or(0)
    }

    /// Registered kind of a metric
    pub async fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.families.read().await.get(name).map(|f| f.kind)
    }

    fn family_for<'a>(
        families: &'a mut BTreeMap<String, MetricFamily>,
        name: &str,
        kind: MetricKind,
    ) -> Result<&'a mut MetricFamily> {
        let family = families
            .entry(name.to_string())
            .or_insert_with(|| MetricFamily::new(kind, ""));
        if family.kind != kind {
            return Err(ConclaveError::Metrics(format!(
                "Metric {} is registered as {}, not {}",
                name, family.kind, kind
            )));
        }
        Ok(family)
    }
}
