use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What `subscribe` does when the machine has not been provided yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribePolicy {
    /// Reply with an error.
    #[default]
    FailFast,
    /// Remember the subscription and send the snapshot once provided.
    Pending,
}

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Producer (event-frame) port.
    pub app_port: u16,
    /// Consumer (WebSocket) port.
    pub client_port: u16,
    /// Admin HTTP port; disabled when unset.
    pub admin_port: Option<u16>,
    /// Outbound frames buffered per consumer before it is evicted.
    pub max_send_queue: usize,
    pub max_frame_payload: usize,
    pub max_event_line: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub subscribe_policy: SubscribePolicy,
    /// Machine name to asset directory.
    pub machine_dirs: HashMap<String, PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            app_port: 8001,
            client_port: 8000,
            admin_port: None,
            max_send_queue: 256,
            max_frame_payload: popcorn_protocol::frame::DEFAULT_MAX_PAYLOAD,
            max_event_line: popcorn_protocol::event::DEFAULT_MAX_LINE_LENGTH,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            subscribe_policy: SubscribePolicy::FailFast,
            machine_dirs: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("client_timeout_secs", self.client_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("max_send_queue", self.max_send_queue as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"client_port": 9000, "subscribe_policy": "pending"}"#).unwrap();
        assert_eq!(config.client_port, 9000);
        assert_eq!(config.app_port, 8001);
        assert_eq!(config.subscribe_policy, SubscribePolicy::Pending);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn load_reports_path_on_error() {
        let err = ServerConfig::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let path = std::env::temp_dir().join(format!("popcorn-zero-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"heartbeat_interval_secs": 0}"#).unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("heartbeat_interval_secs"));

        let config = ServerConfig {
            cleanup_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ServerConfig {
            max_send_queue: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("popcorn-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"admin_port": 8002, "machine_dirs": {"demo": "/srv/demo"}}"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.admin_port, Some(8002));
        assert_eq!(config.machine_dirs["demo"], PathBuf::from("/srv/demo"));
    }
}
