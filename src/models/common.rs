use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_ms: u64,
    /// Aggregates are evicted after this many correlation windows
    pub retention_windows: u32,
    pub sweep_interval_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            retention_windows: 600,
            sweep_interval_secs: 30,
        }
    }
}

impl CorrelationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Saturates instead of overflowing; [`Config::validate`] rejects such
    /// values at load time.
    pub fn retention(&self) -> Duration {
        self.window()
            .checked_mul(self.retention_windows)
            .unwrap_or(Duration::MAX)
    }

    /// Never zero.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "correlation.sweep_interval_secs",
                reason: "must be at least 1",
            });
        }
        if self.retention_windows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "correlation.retention_windows",
                reason: "must be at least 1",
            });
        }
        if self.window().checked_mul(self.retention_windows).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "correlation.retention_windows",
                reason: "window_ms * retention_windows overflows",
            });
        }
        Ok(())
    }
}

/// Linear reconnect schedule: `attempt * step_secs`, capped at `max_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub step_secs: u64,
    pub max_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            step_secs: 2,
            max_secs: 60,
        }
    }
}

impl ReconnectConfig {
    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        if self.step_secs == 0 || self.max_secs < self.step_secs {
            return Err(ConfigError::InvalidValue {
                field: section,
                reason: "step_secs must be at least 1 and not above max_secs",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowConfig {
    pub mints: bool,
    pub transfers: bool,
    /// In whole native coins (ether)
    pub min_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub address: Address,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub show_mints: bool,
    #[serde(default)]
    pub show_transfers: bool,
    #[serde(default)]
    pub from_wallet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub names_ttl: u64,
    pub ens_ttl: u64,
    pub slug_ttl: u64,
    pub floor_ttl: u64,
    pub salira_ttl: u64,
    pub notifications_lock_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            names_ttl: 2 * 24 * 60 * 60,
            ens_ttl: 24 * 60 * 60,
            slug_ttl: 7 * 24 * 60 * 60,
            floor_ttl: 5 * 60,
            salira_ttl: 5 * 60,
            notifications_lock_ttl: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub mgmt_topic: String,
    pub subscribe_delay_ms: u64,
    /// Websocket and management bus reconnects
    pub reconnect: ReconnectConfig,
    pub heartbeat_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.openseabeta.com/socket/websocket".to_string(),
            api_key: None,
            mgmt_topic: "seawatcher/mgmt".to_string(),
            subscribe_delay_ms: 137,
            reconnect: ReconnectConfig::default(),
            heartbeat_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default = "default_workers_per_node")]
    pub workers_per_node: usize,
    /// Log subscription reconnects, per node
    #[serde(default)]
    pub node_reconnect: ReconnectConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub show: ShowConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_workers_per_node() -> usize {
    4
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Config {
    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.correlation.validate()?;
        self.node_reconnect.validate("node_reconnect")?;
        self.stream.reconnect.validate("stream.reconnect")?;
        Ok(())
    }
}
