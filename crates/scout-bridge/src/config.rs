//! # Bridge Configuration
//!
//! Load order (later overrides earlier):
//! 1. Default values
//! 2. Config file (`scout.toml`, or `--config` path)
//! 3. `SCOUT_*` environment variables

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::transport::TransportConfig;

// =============================================================================
// Defaults
// =============================================================================

fn default_thing_name() -> String {
    "scout-thing".to_string()
}

fn default_source_id() -> String {
    "scanner-1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    0 // Infinite
}

fn default_ping_interval() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_resubscribe_timeout() -> u64 {
    10
}

fn default_property() -> String {
    "scan_period_s".to_string()
}

fn default_property_value() -> Value {
    Value::from(10)
}

fn default_event_namespace() -> String {
    "dt/bt_scan_log_v1".to_string()
}

fn default_flush_interval() -> u64 {
    1
}

// =============================================================================
// Sections
// =============================================================================

/// Identity of this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Thing name, the shadow namespace is derived from it.
    #[serde(default = "default_thing_name")]
    pub thing_name: String,

    /// Source identifier appended to the event publish topic.
    #[serde(default = "default_source_id")]
    pub source_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            thing_name: default_thing_name(),
            source_id: default_source_id(),
        }
    }
}

/// Transport session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Broker WebSocket URL (ws:// or wss://).
    pub url: String,

    /// Connection and handshake timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial reconnect backoff in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum reconnect backoff in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Maximum reconnection attempts (0 = infinite).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Keepalive ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Publish hand-off deadline in milliseconds.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Deadline for resubscription after a resume, in seconds.
    #[serde(default = "default_resubscribe_timeout")]
    pub resubscribe_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: default_max_retries(),
            ping_interval_secs: default_ping_interval(),
            publish_timeout_ms: default_publish_timeout(),
            resubscribe_timeout_secs: default_resubscribe_timeout(),
        }
    }
}

/// Shadow reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowSettings {
    /// Name of the tracked property inside the shadow document.
    #[serde(default = "default_property")]
    pub property: String,

    /// Value adopted when the remote store has no opinion.
    #[serde(default = "default_property_value")]
    pub default_value: Value,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        ShadowSettings {
            property: default_property(),
            default_value: default_property_value(),
        }
    }
}

/// Event publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Topic namespace events are published under.
    #[serde(default = "default_event_namespace")]
    pub namespace: String,

    /// Batch flush interval in seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        EventSettings {
            namespace: default_event_namespace(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

// =============================================================================
// Bridge Config
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub shadow: ShadowSettings,

    #[serde(default)]
    pub events: EventSettings,
}

impl BridgeConfig {
    /// Loads configuration from file, environment, and defaults.
    pub fn load(config_path: Option<PathBuf>) -> BridgeResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading bridge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.transport.url.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "transport.url is required".into(),
            ));
        }

        // Must parse as a URL with a ws/wss scheme
        let parsed = url::Url::parse(&self.transport.url)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(BridgeError::InvalidUrl(format!(
                "Broker URL must start with ws:// or wss://, got: {}",
                self.transport.url
            )));
        }

        if self.device.thing_name.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "device.thing_name must not be empty".into(),
            ));
        }

        if self.shadow.property.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "shadow.property must not be empty".into(),
            ));
        }

        if self.events.flush_interval_secs == 0 {
            return Err(BridgeError::InvalidConfig(
                "events.flush_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SCOUT_BROKER_URL") {
            debug!(url = %url, "Overriding broker URL from environment");
            self.transport.url = url;
        }

        if let Ok(name) = std::env::var("SCOUT_THING_NAME") {
            debug!(thing_name = %name, "Overriding thing name from environment");
            self.device.thing_name = name;
        }

        if let Ok(id) = std::env::var("SCOUT_SOURCE_ID") {
            self.device.source_id = id;
        }

        if let Ok(namespace) = std::env::var("SCOUT_EVENT_NAMESPACE") {
            self.events.namespace = namespace;
        }

        if let Ok(interval) = std::env::var("SCOUT_FLUSH_INTERVAL_SECS") {
            match interval.parse::<u64>() {
                Ok(secs) => self.events.flush_interval_secs = secs,
                Err(_) => warn!(value = %interval, "Ignoring bad flush interval in environment"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "scout", "scout")
            .map(|dirs| dirs.config_dir().join("scout.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// The shadow topic namespace for this device.
    pub fn shadow_namespace(&self) -> String {
        format!("shadow/{}", self.device.thing_name)
    }

    /// The transport session configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.transport.url.clone(),
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
            initial_backoff: Duration::from_millis(self.transport.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.transport.max_backoff_secs),
            max_retries: self.transport.max_retries,
            ping_interval: Duration::from_secs(self.transport.ping_interval_secs),
            publish_timeout: Duration::from_millis(self.transport.publish_timeout_ms),
            resubscribe_timeout: Duration::from_secs(self.transport.resubscribe_timeout_secs),
        }
    }

    /// The batch flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.events.flush_interval_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.transport.url = "wss://broker.example/session".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.device.thing_name, "scout-thing");
        assert_eq!(config.device.source_id, "scanner-1");
        assert_eq!(config.shadow.property, "scan_period_s");
        assert_eq!(config.shadow.default_value, Value::from(10));
        assert_eq!(config.events.namespace, "dt/bt_scan_log_v1");
        assert_eq!(config.events.flush_interval_secs, 1);
        assert_eq!(config.transport.max_retries, 0);
    }

    #[test]
    fn test_validate_requires_url() {
        let config = BridgeConfig::default();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_websocket_scheme() {
        let mut config = valid_config();
        config.transport.url = "https://broker.example".into();
        assert!(matches!(config.validate(), Err(BridgeError::InvalidUrl(_))));
    }

    #[test]
    fn test_validate_accepts_ws_and_wss() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());
        config.transport.url = "ws://localhost:9001".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_flush_interval() {
        let mut config = valid_config();
        config.events.flush_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shadow_namespace() {
        let mut config = valid_config();
        config.device.thing_name = "local-tester".into();
        assert_eq!(config.shadow_namespace(), "shadow/local-tester");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [transport]
            url = "wss://broker.example/session"

            [device]
            thing_name = "local-tester"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.thing_name, "local-tester");
        assert_eq!(config.device.source_id, "scanner-1");
        assert_eq!(config.transport.connect_timeout_secs, 10);
        assert_eq!(config.shadow.property, "scan_period_s");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_config_conversion() {
        let mut config = valid_config();
        config.transport.publish_timeout_ms = 2000;
        let transport = config.transport_config();
        assert_eq!(transport.publish_timeout, Duration::from_millis(2000));
        assert_eq!(transport.initial_backoff, Duration::from_millis(500));
    }
}
