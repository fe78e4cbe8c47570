use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Type of metric.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// One metric value as exposed on the admin endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: i64,
    pub metric_type: MetricType,
}

/// Point-in-time copy of every metric, sorted by name then labels.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<i64> {
        self.samples
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .reduce(|a, b| a + b)
    }
}

/// Metric key: name + labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-process metrics: monotonic counters and up/down gauges.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut rows: Vec<(MetricKey, i64, MetricType)> = Vec::new();
        for (key, c) in self.counters.read().iter() {
            let value = i64::try_from(c.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
            rows.push((key.clone(), value, MetricType::Counter));
        }
        for (key, g) in self.gauges.read().iter() {
            rows.push((key.clone(), g.load(Ordering::Relaxed), MetricType::Gauge));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            taken_at: Utc::now(),
            samples: rows
                .into_iter()
                .map(|(key, value, metric_type)| MetricSample {
                    name: key.name,
                    labels: key.labels.into_iter().collect(),
                    value,
                    metric_type,
                })
                .collect(),
        }
    }
}
