//! SDK configuration.
//!
//! Options load from a TOML file or are built in code; every field has a
//! production default so `ClientOptions::default()` is a working setup.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use termlink_wire::TransportConfig;

/// Top-level SDK options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Application tag stamped onto requests and used to partition
    /// history/synchronization streams on the server.
    pub application: String,

    /// Request/response deadline (seconds).
    pub request_timeout_in_seconds: u64,

    /// Initial socket connect deadline (seconds).
    pub connect_timeout_in_seconds: u64,

    /// How long the packet orderer waits on a sequence gap (seconds).
    pub packet_ordering_timeout_in_seconds: u64,

    /// Broker-status watchdog timeout (milliseconds).
    pub status_timer_timeout_in_milliseconds: u64,

    /// Synchronization retry back-off bounds.
    pub synchronization_retry_interval_in_seconds: RetryIntervalOptions,

    /// Health monitor options.
    pub health_monitor: HealthMonitorOptions,
}

/// Bounds for the synchronization retry back-off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryIntervalOptions {
    /// First retry delay (seconds). Doubles per failed attempt.
    pub initial: u64,
    /// Retry delay cap (seconds).
    pub max: u64,
}

/// Health monitor options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthMonitorOptions {
    /// Uptime sampling period (milliseconds).
    pub sample_period_in_milliseconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            application: "MetaApi".to_string(),
            request_timeout_in_seconds: 60,
            connect_timeout_in_seconds: 60,
            packet_ordering_timeout_in_seconds: 60,
            status_timer_timeout_in_milliseconds: 60_000,
            synchronization_retry_interval_in_seconds: RetryIntervalOptions::default(),
            health_monitor: HealthMonitorOptions::default(),
        }
    }
}

impl Default for RetryIntervalOptions {
    fn default() -> Self {
        Self { initial: 1, max: 300 }
    }
}

impl Default for HealthMonitorOptions {
    fn default() -> Self {
        Self {
            sample_period_in_milliseconds: 1_000,
        }
    }
}

impl ClientOptions {
    /// Loads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let options: ClientOptions = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.application.is_empty() {
            bail!("application must not be empty");
        }
        let retry = &self.synchronization_retry_interval_in_seconds;
        if retry.initial == 0 {
            bail!("synchronization retry initial interval must be at least 1 second");
        }
        if retry.max < retry.initial {
            bail!(
                "synchronization retry max ({}s) must not be below initial ({}s)",
                retry.max,
                retry.initial
            );
        }
        if self.health_monitor.sample_period_in_milliseconds == 0 {
            bail!("health monitor sample period must be positive");
        }
        Ok(())
    }

    /// Request deadline as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }

    /// Connect deadline as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_in_seconds)
    }

    /// Packet-ordering gap timeout as a `Duration`.
    pub fn packet_ordering_timeout(&self) -> Duration {
        Duration::from_secs(self.packet_ordering_timeout_in_seconds)
    }

    /// Broker-status watchdog timeout as a `Duration`.
    pub fn status_timer_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timer_timeout_in_milliseconds)
    }

    /// Health sampling period as a `Duration`.
    pub fn health_sample_period(&self) -> Duration {
        Duration::from_millis(self.health_monitor.sample_period_in_milliseconds)
    }

    /// Builds the transport configuration these options imply.
    pub fn transport_config(&self, url: impl Into<String>) -> TransportConfig {
        let mut config = TransportConfig::new(url);
        config.application = self.application.clone();
        config.request_timeout = self.request_timeout();
        config.connect_timeout = self.connect_timeout();
        config.packet_ordering_timeout = self.packet_ordering_timeout();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let options = ClientOptions::default();
        assert_eq!(options.application, "MetaApi");
        assert_eq!(options.request_timeout(), Duration::from_secs(60));
        assert_eq!(options.packet_ordering_timeout(), Duration::from_secs(60));
        assert_eq!(options.status_timer_timeout(), Duration::from_millis(60_000));
        assert_eq!(options.synchronization_retry_interval_in_seconds.initial, 1);
        assert_eq!(options.synchronization_retry_interval_in_seconds.max, 300);
        assert_eq!(options.health_sample_period(), Duration::from_millis(1_000));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let options: ClientOptions = toml::from_str(
            r#"
            application = "RPC"

            [synchronization_retry_interval_in_seconds]
            initial = 2
            "#,
        )
        .expect("config should parse");
        assert_eq!(options.application, "RPC");
        assert_eq!(options.synchronization_retry_interval_in_seconds.initial, 2);
        assert_eq!(options.synchronization_retry_interval_in_seconds.max, 300);
        assert_eq!(options.request_timeout_in_seconds, 60);
    }

    #[test]
    fn test_validate_rejects_inverted_retry_bounds() {
        let mut options = ClientOptions::default();
        options.synchronization_retry_interval_in_seconds = RetryIntervalOptions {
            initial: 10,
            max: 5,
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sample_period() {
        let mut options = ClientOptions::default();
        options.health_monitor.sample_period_in_milliseconds = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_transport_config_carries_timeouts() {
        let mut options = ClientOptions::default();
        options.application = "RPC".to_string();
        options.request_timeout_in_seconds = 15;
        options.packet_ordering_timeout_in_seconds = 30;
        let config = options.transport_config("wss://gateway.test/ws");
        assert_eq!(config.url, "wss://gateway.test/ws");
        assert_eq!(config.application, "RPC");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.packet_ordering_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
    }
}
