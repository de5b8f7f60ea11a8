//! File-backed entry source and its change watcher.
//!
//! The entry file is a JSON array (or YAML sequence, chosen by extension) of
//! objects:
//!
//! ```json
//! [
//!   { "locator": "/Library/Preferences/com.apple.alf.plist",
//!     "value_name": "globalstate",
//!     "display_name": "Application firewall",
//!     "critical": true }
//! ]
//! ```
//!
//! Entries missing `locator` or `value_name` are skipped with a warning; the
//! load only fails when the file is unreadable, not a list, or yields no
//! valid entry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::watch;

use crate::errors::WardenError;
use crate::model::{EntryKey, EntrySpec};
use crate::traits::EntrySource;

/// One element of the entry file, before validation.
///
/// The camelCase aliases accept entry files written for the plist and
/// registry agents.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default, alias = "plistPath", alias = "keyPath")]
    locator: Option<String>,
    #[serde(default, alias = "valueName")]
    value_name: Option<String>,
    #[serde(default, alias = "displayName")]
    display_name: Option<String>,
    #[serde(default, alias = "isCritical")]
    critical: bool,
}

/// Entry source reading a JSON or YAML file.
#[derive(Debug, Clone)]
pub struct FileEntrySource {
    path: PathBuf,
}

impl FileEntrySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }

    /// Parse entry file contents. Exposed for sources that obtain the text
    /// some other way.
    pub fn parse(content: &str, yaml: bool) -> Result<Vec<EntrySpec>, WardenError> {
        let document: serde_json::Value = if yaml {
            serde_yaml::from_str(content)?
        } else {
            serde_json::from_str(content)?
        };

        let items = document.as_array().ok_or_else(|| {
            WardenError::Config("entry file must contain a top-level list".to_string())
        })?;

        let mut seen: HashSet<EntryKey> = HashSet::new();
        let mut entries = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let raw: RawEntry = match serde_json::from_value(item.clone()) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed entry");
                    continue;
                }
            };

            let locator = raw.locator.unwrap_or_default().trim().to_string();
            let value_name = raw.value_name.unwrap_or_default().trim().to_string();
            if locator.is_empty() || value_name.is_empty() {
                tracing::warn!(index, "skipping entry missing locator or value_name");
                continue;
            }

            let key = EntryKey::new(locator, value_name);
            if !seen.insert(key.clone()) {
                tracing::warn!(index, key = %key, "skipping duplicate entry");
                continue;
            }

            let display_name = raw
                .display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| key.value_name.clone());

            entries.push(EntrySpec {
                key,
                display_name,
                critical: raw.critical,
            });
        }

        if entries.is_empty() {
            return Err(WardenError::Config(
                "entry file contains no valid entries".to_string(),
            ));
        }
        Ok(entries)
    }
}

impl EntrySource for FileEntrySource {
    fn load(&self) -> Result<Vec<EntrySpec>, WardenError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            WardenError::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let entries = Self::parse(&content, self.is_yaml()).map_err(|e| {
            WardenError::Config(format!("failed to load {}: {e}", self.path.display()))
        })?;
        tracing::debug!(path = %self.path.display(), count = entries.len(), "loaded entry file");
        Ok(entries)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Watches an entry file and bumps a generation counter on every change.
///
/// The parent directory is watched rather than the file itself so that
/// editors which replace the file by rename keep triggering events.
pub struct EntryWatcher {
    _watcher: RecommendedWatcher,
}

impl EntryWatcher {
    /// Start watching `path`. The receiver observes a new generation number
    /// after each create/modify/remove touching the file.
    pub fn start(path: &Path) -> Result<(Self, watch::Receiver<u64>), WardenError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| WardenError::Config(format!("not a file path: {}", path.display())))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = watch::channel(0u64);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        tx.send_modify(|generation| *generation += 1);
                    }
                }
                Err(e) => {
                    tracing::error!("entry file watcher error: {e}");
                }
            }
        })
        .map_err(|e| WardenError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| WardenError::Config(format!("failed to watch {}: {e}", dir.display())))?;

        tracing::info!(path = %path.display(), "watching entry file");
        Ok((Self { _watcher: watcher }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_json_entries() {
        let entries = FileEntrySource::parse(
            r#"[
                {"locator": "/etc/a.json", "value_name": "x", "critical": true},
                {"locator": "/etc/b.json", "value_name": "y", "display_name": "Why"}
            ]"#,
            false,
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, EntryKey::new("/etc/a.json", "x"));
        assert_eq!(entries[0].display_name, "x");
        assert!(entries[0].critical);
        assert_eq!(entries[1].display_name, "Why");
        assert!(!entries[1].critical);
    }

    #[test]
    fn test_parse_yaml_entries() {
        let entries = FileEntrySource::parse(
            "- locator: HKLM\\Software\\Policies\n  value_name: EnableFirewall\n  critical: true\n",
            true,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.value_name, "EnableFirewall");
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let entries = FileEntrySource::parse(
            r#"[{"plistPath": "/Library/Preferences/com.apple.alf.plist", "valueName": "globalstate", "isCritical": true}]"#,
            false,
        )
        .unwrap();
        assert_eq!(
            entries[0].key,
            EntryKey::new("/Library/Preferences/com.apple.alf.plist", "globalstate")
        );
        assert!(entries[0].critical);
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let entries = FileEntrySource::parse(
            r#"[
                {"locator": "/etc/a.json"},
                {"value_name": "orphan"},
                "not an object",
                {"locator": "  ", "value_name": "blank"},
                {"locator": "/etc/a.json", "value_name": "ok"}
            ]"#,
            false,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.value_name, "ok");
    }

    #[test]
    fn test_duplicates_keep_first() {
        let entries = FileEntrySource::parse(
            r#"[
                {"locator": "L", "value_name": "v", "critical": true},
                {"locator": "L", "value_name": "v", "critical": false}
            ]"#,
            false,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].critical);
    }

    #[test]
    fn test_zero_valid_entries_is_error() {
        let err = FileEntrySource::parse(r#"[{"locator": "L"}]"#, false).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_top_level_must_be_list() {
        let err = FileEntrySource::parse(r#"{"locator": "L", "value_name": "v"}"#, false)
            .unwrap_err();
        assert!(err.to_string().contains("top-level list"));
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.yml");
        fs::write(&path, "- locator: L\n  value_name: v\n").unwrap();

        let source = FileEntrySource::new(&path);
        let entries = source.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(source.describe(), path.display().to_string());
    }

    #[test]
    fn test_load_missing_file() {
        let source = FileEntrySource::new("/nonexistent/warden/entries.json");
        let err = source.load().unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[tokio::test]
    async fn test_watcher_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        fs::write(&path, "[]").unwrap();

        let (_watcher, mut rx) = EntryWatcher::start(&path).unwrap();
        fs::write(&path, r#"[{"locator": "L", "value_name": "v"}]"#).unwrap();

        let changed = tokio::time::timeout(std::time::Duration::from_secs(5), rx.changed()).await;
        if changed.is_ok() {
            assert!(*rx.borrow() >= 1);
        }
    }
}
