/// Configuration types for the Warden monitor, parsed from `warden.yaml`.
///
/// ```yaml
/// poll_interval_ms: 1000
/// entries_file: monitored.json
/// audit_database: warden.db
/// alerts:
///   max_per_hour: 10
///   muted: false
///   non_critical_threshold: 3
///   critical_timing: delayed
///   critical_grace_secs: 10
/// channels:
///   - kind: webhook
///     url: https://hooks.example.com/warden
///     recipients: ["ops@example.com"]
/// ```
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Alerts allowed per rolling hour when the setting is unset or not positive.
pub const DEFAULT_MAX_ALERTS_PER_HOUR: u32 = 10;

/// Scan loop period when the setting is unset.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Grace window for delayed critical alerts when the setting is unset.
pub const DEFAULT_CRITICAL_GRACE_SECS: u64 = 10;

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Period of the scan loop in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Entry list (JSON or YAML), relative to the config directory.
    pub entries_file: PathBuf,
    /// SQLite audit database path, relative to the config directory.
    /// `None` keeps the history in memory only.
    #[serde(default)]
    pub audit_database: Option<PathBuf>,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl WardenConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// When the alert for a critical change is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalAlertTiming {
    /// Dispatch as soon as the change is detected.
    #[default]
    Immediate,
    /// Dispatch after the grace window unless the change was approved first.
    Delayed,
}

/// Alerting policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Maximum successful dispatches per rolling hour. Unset or <= 0 means
    /// [`DEFAULT_MAX_ALERTS_PER_HOUR`].
    #[serde(default)]
    pub max_per_hour: Option<i64>,
    /// Suppress every alert.
    #[serde(default)]
    pub muted: bool,
    /// Non-critical changes needed before an alert fires. <= 0 disables
    /// non-critical alerts.
    #[serde(default)]
    pub non_critical_threshold: i64,
    #[serde(default)]
    pub critical_timing: CriticalAlertTiming,
    #[serde(default = "default_critical_grace_secs")]
    pub critical_grace_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_per_hour: None,
            muted: false,
            non_critical_threshold: 0,
            critical_timing: CriticalAlertTiming::Immediate,
            critical_grace_secs: DEFAULT_CRITICAL_GRACE_SECS,
        }
    }
}

impl AlertConfig {
    /// The hourly limit actually enforced.
    pub fn effective_max_per_hour(&self) -> u32 {
        match self.max_per_hour {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_MAX_ALERTS_PER_HOUR,
        }
    }

    /// The non-critical threshold, or `None` when threshold alerts are off.
    pub fn threshold(&self) -> Option<u32> {
        if self.non_critical_threshold > 0 {
            Some(u32::try_from(self.non_critical_threshold).unwrap_or(u32::MAX))
        } else {
            None
        }
    }

    pub fn critical_grace(&self) -> Duration {
        Duration::from_secs(self.critical_grace_secs)
    }
}

fn default_critical_grace_secs() -> u64 {
    DEFAULT_CRITICAL_GRACE_SECS
}

/// Transport used by a configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// JSON POST to an HTTP endpoint.
    Webhook,
    /// Write the alert to the tracing log only.
    Log,
}

/// One notification channel and the recipients it delivers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    /// Endpoint URL, required for webhooks.
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer token sent with webhook requests.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Request timeout for webhook deliveries, in seconds.
    #[serde(default = "default_channel_timeout_secs")]
    pub timeout_secs: u64,
    pub recipients: Vec<String>,
}

fn default_channel_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: WardenConfig = serde_yaml::from_str("entries_file: monitored.json\n").unwrap();
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.audit_database.is_none());
        assert!(config.channels.is_empty());
        assert_eq!(config.alerts, AlertConfig::default());
    }

    #[test]
    fn test_effective_max_per_hour() {
        let mut alerts = AlertConfig::default();
        assert_eq!(alerts.effective_max_per_hour(), 10);
        alerts.max_per_hour = Some(0);
        assert_eq!(alerts.effective_max_per_hour(), 10);
        alerts.max_per_hour = Some(-3);
        assert_eq!(alerts.effective_max_per_hour(), 10);
        alerts.max_per_hour = Some(1);
        assert_eq!(alerts.effective_max_per_hour(), 1);
    }

    #[test]
    fn test_threshold_disabled_when_not_positive() {
        let mut alerts = AlertConfig::default();
        assert_eq!(alerts.threshold(), None);
        alerts.non_critical_threshold = -1;
        assert_eq!(alerts.threshold(), None);
        alerts.non_critical_threshold = 3;
        assert_eq!(alerts.threshold(), Some(3));
    }

    #[test]
    fn test_critical_timing_parses_snake_case() {
        let alerts: AlertConfig =
            serde_yaml::from_str("critical_timing: delayed\ncritical_grace_secs: 5\n").unwrap();
        assert_eq!(alerts.critical_timing, CriticalAlertTiming::Delayed);
        assert_eq!(alerts.critical_grace(), Duration::from_secs(5));
    }
}
