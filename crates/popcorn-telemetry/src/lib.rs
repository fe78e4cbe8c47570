mod metrics;

pub use metrics::{MetricSample, MetricType, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    #[serde(with = "level_name")]
    pub log_level: Level,
    /// Per-module level overrides (e.g. "popcorn_server" => DEBUG).
    #[serde(skip)]
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether metrics recording is enabled.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// The filter directive built from the configured levels.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps telemetry state alive for the life of the process.
pub struct TelemetryGuard {
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// Shared handle to the metrics recorder, when enabled.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; later calls
/// keep the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("telemetry already initialized");
    }

    TelemetryGuard {
        metrics_recorder: config
            .metrics_enabled
            .then(|| Arc::new(MetricsRecorder::new())),
    }
}

mod level_name {
    use serde::{Deserialize, Deserializer};
    use tracing::Level;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
