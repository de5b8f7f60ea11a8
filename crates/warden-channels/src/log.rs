//! Notification channel that only writes to the tracing log.
//!
//! Useful as a fallback when no external transport is configured, and for
//! running the daemon locally.

use async_trait::async_trait;

use warden_types::errors::WardenError;
use warden_types::traits::NotificationChannel;

/// Writes each alert as a `warn` event. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, recipient: &str, message: &str) -> Result<(), WardenError> {
        tracing::warn!(target: "warden::alert", recipient = %recipient, "{message}");
        Ok(())
    }
}
