use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level daemon configuration, loaded from `rollout.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RolloutConfig {
    pub server: ServerSection,
    pub store: StoreSection,
    pub fleet: FleetSection,
    pub monitoring: MonitoringSection,
}

impl RolloutConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.store.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub base_dir: String,
    pub db_path: String,
    pub create_if_missing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetSection {
    pub fleet_base_url: String,
    pub telemetry_base_url: String,
    pub request_timeout_seconds: u64,
}

/// Cadence and staleness windows for the per-deployment monitoring loops.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSection {
    pub interval_seconds: u64,
    pub window_seconds: u64,
    pub stale_after_seconds: u64,
    pub silence_alert_after_seconds: u64,
}

impl MonitoringSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_seconds as i64)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_seconds as i64)
    }

    pub fn silence_alert_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.silence_alert_after_seconds as i64)
    }
}

pub fn load_rollout_config<P: AsRef<Path>>(path: P) -> ConfigResult<RolloutConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/rollout.toml");
        let config = load_rollout_config(path).expect("fixture config should parse");
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert!(config.monitoring.interval_seconds >= 30);
        assert!(config.monitoring.silence_alert_after_seconds > config.monitoring.stale_after_seconds);
        assert!(config.store.create_if_missing);
    }

    #[test]
    fn resolve_path_keeps_absolute_paths() {
        let config = RolloutConfig {
            server: ServerSection {
                bind_address: "127.0.0.1".into(),
                port: 8080,
                enable_cors: true,
                request_timeout_seconds: 30,
            },
            store: StoreSection {
                base_dir: "/var/lib/rollout".into(),
                db_path: "deployments.sqlite".into(),
                create_if_missing: true,
            },
            fleet: FleetSection {
                fleet_base_url: "http://fleet.local".into(),
                telemetry_base_url: "http://telemetry.local".into(),
                request_timeout_seconds: 10,
            },
            monitoring: MonitoringSection {
                interval_seconds: 30,
                window_seconds: 300,
                stale_after_seconds: 120,
                silence_alert_after_seconds: 600,
            },
        };
        assert_eq!(
            config.resolve_path("/tmp/other.sqlite"),
            PathBuf::from("/tmp/other.sqlite")
        );
        assert_eq!(
            config.resolve_path("deployments.sqlite"),
            PathBuf::from("/var/lib/rollout/deployments.sqlite")
        );
    }
}
