//! Operator commands read line by line from stdin while `warden run` is up.
//!
//! ```text
//! allow <locator::value_name>
//! critical <locator::value_name>
//! noncritical <locator::value_name>
//! status
//! ```

use warden_core::Monitor;
use warden_types::errors::WardenError;
use warden_types::model::EntryKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Approve the pending change for an entry.
    Allow(EntryKey),
    SetCritical(EntryKey, bool),
    /// Print every entry with its current and baseline values.
    Status,
}

impl ControlCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments for '{verb}'"));
        }

        let key = || -> Result<EntryKey, String> {
            let text = arg.ok_or_else(|| format!("'{verb}' needs an entry key"))?;
            EntryKey::parse(text)
                .ok_or_else(|| format!("invalid key '{text}', expected locator::value_name"))
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "allow" | "approve" => Self::Allow(key()?),
            "critical" => Self::SetCritical(key()?, true),
            "noncritical" => Self::SetCritical(key()?, false),
            "status" if arg.is_none() => Self::Status,
            "status" => return Err("'status' takes no arguments".to_string()),
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(Some(command))
    }

    pub async fn apply(&self, monitor: &Monitor) -> Result<(), WardenError> {
        match self {
            Self::Allow(key) => monitor.allow_change(key).await,
            Self::SetCritical(key, critical) => monitor.set_critical_status(key, *critical).await,
            Self::Status => {
                for entry in monitor.snapshot() {
                    println!(
                        "{}{}  current={}  baseline={}{}",
                        if entry.critical { "* " } else { "  " },
                        entry.key,
                        entry.current_value.as_deref().unwrap_or("-"),
                        entry.previous_value.as_deref().unwrap_or("-"),
                        entry
                            .pending_value
                            .as_deref()
                            .map(|v| format!("  pending={v}"))
                            .unwrap_or_default(),
                    );
                }
                Ok(())
            }
        }
    }
}
