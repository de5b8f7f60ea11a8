/// Config directory loader with validation and hot-reload support.
///
/// Reads `warden.yaml` from a directory path, validates on load, watches for
/// file changes via `notify`, and emits config change events via
/// `tokio::sync::watch`.
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::*;
use crate::errors::WardenError;

/// Name of the settings file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "warden.yaml";

/// Loads, validates, and watches configuration from a directory.
///
/// Expected directory structure:
/// ```text
/// config/
/// ├── warden.yaml
/// └── monitored.json      (named by `entries_file`)
/// ```
pub struct ConfigLoader {
    /// Root config directory path.
    config_dir: PathBuf,
    /// Watch sender for broadcasting config changes.
    tx: watch::Sender<WardenConfig>,
    /// File watcher handle (kept alive to maintain the watch).
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigLoader {
    /// Load and validate `warden.yaml`, returning a `ConfigLoader` along with a
    /// `watch::Receiver` for subscribing to config changes.
    ///
    /// Call `watch()` afterwards to start hot-reload file watching.
    pub fn load(config_dir: &Path) -> Result<(Self, watch::Receiver<WardenConfig>), WardenError> {
        let config = Self::load_config(config_dir)?;
        Self::validate(&config)?;

        let (tx, rx) = watch::channel(config);

        Ok((
            Self {
                config_dir: config_dir.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Root directory this loader reads from.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Resolve a path from the config file against the config directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    /// Start watching `warden.yaml` for changes.
    ///
    /// A valid new config is broadcast via the watch channel. Invalid configs
    /// are logged and the previous config stays current.
    pub fn watch(&mut self) -> Result<(), WardenError> {
        let config_dir = self.config_dir.clone();
        let tx = self.tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touches_config = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(CONFIG_FILE_NAME));
                    if touches_config
                        && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    {
                        match Self::load_config(&config_dir) {
                            Ok(config) => match Self::validate(&config) {
                                Ok(()) => {
                                    let _ = tx.send(config);
                                    tracing::info!("config reloaded successfully");
                                }
                                Err(e) => {
                                    tracing::warn!("config validation failed after file change, keeping previous config: {e}");
                                }
                            },
                            Err(e) => {
                                tracing::warn!("config load failed after file change, keeping previous config: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("file watcher error: {e}");
                }
            }
        })
        .map_err(|e| WardenError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| WardenError::Config(format!("failed to watch config directory: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(dir = %self.config_dir.display(), "started watching config directory");
        Ok(())
    }

    /// Read and parse `warden.yaml` from the config directory.
    pub fn load_config(config_dir: &Path) -> Result<WardenConfig, WardenError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| WardenError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Validate the config for internal consistency.
    ///
    /// Checks:
    /// - Poll interval is positive
    /// - Entries file is named
    /// - Delayed critical alerts have a positive grace window
    /// - Webhook channels have an http(s) URL and every channel has recipients
    pub fn validate(config: &WardenConfig) -> Result<(), WardenError> {
        if config.poll_interval_ms == 0 {
            return Err(WardenError::Config(
                "poll_interval_ms must be positive (got 0)".to_string(),
            ));
        }
        if config.entries_file.as_os_str().is_empty() {
            return Err(WardenError::Config("entries_file must not be empty".to_string()));
        }
        Self::validate_alerts(&config.alerts)?;
        for (index, channel) in config.channels.iter().enumerate() {
            validate_channel(channel, index)?;
        }
        Ok(())
    }

    /// Validate alert policy.
    fn validate_alerts(alerts: &AlertConfig) -> Result<(), WardenError> {
        if alerts.critical_timing == CriticalAlertTiming::Delayed && alerts.critical_grace_secs == 0 {
            return Err(WardenError::Config(
                "critical_grace_secs must be positive when critical_timing is 'delayed'".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate one channel entry.
fn validate_channel(channel: &ChannelConfig, index: usize) -> Result<(), WardenError> {
    if channel.recipients.is_empty() {
        return Err(WardenError::Config(format!(
            "channel #{index} ({:?}): at least one recipient is required",
            channel.kind
        )));
    }
    if channel.recipients.iter().any(|r| r.trim().is_empty()) {
        return Err(WardenError::Config(format!(
            "channel #{index} ({:?}): recipients must not be blank",
            channel.kind
        )));
    }

    if channel.kind == ChannelKind::Webhook {
        let url = channel.url.as_deref().unwrap_or_default();
        if url.is_empty() {
            return Err(WardenError::Config(format!(
                "channel #{index} (webhook): url is required"
            )));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(WardenError::Config(format!(
                "channel #{index} (webhook): invalid url '{url}' (expected http:// or https://)"
            )));
        }
        if channel.timeout_secs == 0 {
            return Err(WardenError::Config(format!(
                "channel #{index} (webhook): timeout_secs must be positive"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Create a temporary config directory with a valid `warden.yaml`.
    fn setup_config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
poll_interval_ms: 500
entries_file: monitored.json
audit_database: warden.db
alerts:
  max_per_hour: 5
  non_critical_threshold: 3
  critical_timing: delayed
  critical_grace_secs: 10
channels:
  - kind: webhook
    url: https://hooks.example.com/warden
    recipients:
      - ops@example.com
      - "+15550100"
  - kind: log
    recipients: [console]
"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_load_valid_config() {
        let dir = setup_config_dir();
        let (loader, rx) = ConfigLoader::load(dir.path()).unwrap();
        let config = rx.borrow().clone();

        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.alerts.effective_max_per_hour(), 5);
        assert_eq!(config.alerts.threshold(), Some(3));
        assert_eq!(config.alerts.critical_timing, CriticalAlertTiming::Delayed);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].recipients.len(), 2);
        assert_eq!(
            loader.resolve(&config.entries_file),
            dir.path().join("monitored.json")
        );
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let dir = setup_config_dir();
        let (loader, _rx) = ConfigLoader::load(dir.path()).unwrap();
        let absolute = std::env::temp_dir().join("elsewhere.db");
        assert_eq!(loader.resolve(&absolute), absolute);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load(dir.path()).err().unwrap();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "poll_interval_ms: [not, a, number]\n").unwrap();
        let err = ConfigLoader::load(dir.path()).err().unwrap();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config: WardenConfig =
            serde_yaml::from_str("poll_interval_ms: 0\nentries_file: e.json\n").unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_delayed_timing_requires_grace() {
        let config: WardenConfig = serde_yaml::from_str(
            "entries_file: e.json\nalerts:\n  critical_timing: delayed\n  critical_grace_secs: 0\n",
        )
        .unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("critical_grace_secs"));
    }

    #[test]
    fn test_webhook_requires_url() {
        let config: WardenConfig = serde_yaml::from_str(
            "entries_file: e.json\nchannels:\n  - kind: webhook\n    recipients: [a]\n",
        )
        .unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("url is required"));
    }

    #[test]
    fn test_webhook_rejects_non_http_url() {
        let config: WardenConfig = serde_yaml::from_str(
            "entries_file: e.json\nchannels:\n  - kind: webhook\n    url: ftp://x\n    recipients: [a]\n",
        )
        .unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("invalid url"));
    }

    #[test]
    fn test_channel_requires_recipients() {
        let config: WardenConfig = serde_yaml::from_str(
            "entries_file: e.json\nchannels:\n  - kind: log\n    recipients: []\n",
        )
        .unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("recipient"));
    }

    #[tokio::test]
    async fn test_watch_reloads_on_change() {
        let dir = setup_config_dir();
        let (mut loader, mut rx) = ConfigLoader::load(dir.path()).unwrap();
        loader.watch().unwrap();

        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "poll_interval_ms: 2000\nentries_file: monitored.json\n",
        )
        .unwrap();

        let changed = tokio::time::timeout(std::time::Duration::from_secs(5), rx.changed()).await;
        if changed.is_ok() {
            assert_eq!(rx.borrow().poll_interval_ms, 2000);
        }
    }

    #[tokio::test]
    async fn test_watch_keeps_previous_config_on_invalid_change() {
        let dir = setup_config_dir();
        let (mut loader, rx) = ConfigLoader::load(dir.path()).unwrap();
        loader.watch().unwrap();

        fs::write(dir.path().join(CONFIG_FILE_NAME), "poll_interval_ms: 0\nentries_file: x\n").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert_eq!(rx.borrow().poll_interval_ms, 500);
    }
}
