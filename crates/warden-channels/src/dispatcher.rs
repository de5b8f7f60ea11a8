//! Rate-limited, multi-channel alert dispatcher.
//!
//! Every send attempt:
//! - prunes dispatch timestamps older than one hour
//! - rejects the alert outright when the hourly budget is spent
//! - fans out to every recipient of every channel independently
//! - records one timestamp when at least one delivery succeeded
//!
//! The timestamp window is held under an async mutex for the whole attempt,
//! so concurrent sends can never overshoot the budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_types::config::{AlertConfig, ChannelConfig, ChannelKind};
use warden_types::errors::WardenError;
use warden_types::traits::NotificationChannel;

use crate::log::LogChannel;
use crate::webhook::{WebhookChannel, WebhookConfig};

/// Length of the rolling rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// A channel together with the recipients it delivers to.
#[derive(Clone)]
pub struct ChannelRoute {
    pub channel: Arc<dyn NotificationChannel>,
    pub recipients: Vec<String>,
}

impl ChannelRoute {
    pub fn new(channel: Arc<dyn NotificationChannel>, recipients: Vec<String>) -> Self {
        Self {
            channel,
            recipients,
        }
    }
}

/// Build channel routes from configuration.
pub fn routes_from_config(channels: &[ChannelConfig]) -> Result<Vec<ChannelRoute>, WardenError> {
    channels
        .iter()
        .map(|config| {
            let channel: Arc<dyn NotificationChannel> = match config.kind {
                ChannelKind::Webhook => {
                    let url = config.url.clone().ok_or_else(|| {
                        WardenError::Config("webhook channel requires a url".to_string())
                    })?;
                    Arc::new(WebhookChannel::new(WebhookConfig {
                        url,
                        auth_token: config.auth_token.clone(),
                        timeout: Duration::from_secs(config.timeout_secs),
                    })?)
                }
                ChannelKind::Log => Arc::new(LogChannel),
            };
            Ok(ChannelRoute::new(channel, config.recipients.clone()))
        })
        .collect()
}

/// Dispatcher policy derived from [`AlertConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_per_hour: u32,
    pub muted: bool,
}

impl From<&AlertConfig> for DispatchPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            max_per_hour: config.effective_max_per_hour(),
            muted: config.muted,
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&AlertConfig::default())
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one delivery succeeded.
    Delivered { succeeded: usize, failed: usize },
    /// Every delivery failed; no timestamp recorded.
    AllFailed { failed: usize },
    /// Hourly budget spent; nothing attempted.
    RateLimited,
    /// Alerts are muted; nothing attempted.
    Muted,
    /// No channel or recipient configured.
    NoRoutes,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Sends alert messages across all configured channels under an hourly limit.
pub struct AlertDispatcher {
    routes: RwLock<Vec<ChannelRoute>>,
    policy: RwLock<DispatchPolicy>,
    /// Instants of successful dispatches inside the current window, oldest first.
    sent: Mutex<VecDeque<Instant>>,
}

impl AlertDispatcher {
    pub fn new(routes: Vec<ChannelRoute>, policy: DispatchPolicy) -> Self {
        Self {
            routes: RwLock::new(routes),
            policy: RwLock::new(policy),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Build a dispatcher straight from configuration.
    pub fn from_config(alerts: &AlertConfig, channels: &[ChannelConfig]) -> Result<Self, WardenError> {
        Ok(Self::new(routes_from_config(channels)?, DispatchPolicy::from(alerts)))
    }

    /// Replace the channel routes (config hot reload).
    pub async fn set_routes(&self, routes: Vec<ChannelRoute>) {
        *self.routes.write().await = routes;
    }

    /// Replace the rate-limit and mute policy (config hot reload).
    ///
    /// Already-recorded timestamps are kept, so lowering the limit takes
    /// effect immediately.
    pub async fn set_policy(&self, policy: DispatchPolicy) {
        *self.policy.write().await = policy;
    }

    pub async fn policy(&self) -> DispatchPolicy {
        *self.policy.read().await
    }

    /// Successful dispatches inside the current window.
    pub async fn recent_count(&self) -> usize {
        let mut sent = self.sent.lock().await;
        prune(&mut sent, Instant::now());
        sent.len()
    }

    /// Send `message`; true iff at least one delivery succeeded.
    pub async fn send(&self, message: &str) -> bool {
        self.dispatch(message).await.is_delivered()
    }

    /// Send `message` and report what happened.
    pub async fn dispatch(&self, message: &str) -> DispatchOutcome {
        let policy = *self.policy.read().await;
        if policy.muted {
            info!("alerts muted, skipping alert");
            return DispatchOutcome::Muted;
        }

        let mut sent = self.sent.lock().await;
        prune(&mut sent, Instant::now());

        debug!(
            recent = sent.len(),
            allowed = policy.max_per_hour,
            "alerts sent in the last hour"
        );
        if sent.len() >= policy.max_per_hour as usize {
            let suppressed = WardenError::RateLimitExceeded(format!(
                "{} alerts already sent in the last hour",
                sent.len()
            ));
            info!(limit = policy.max_per_hour, "{suppressed}; skipping alert");
            return DispatchOutcome::RateLimited;
        }

        let routes = self.routes.read().await.clone();
        if routes.iter().all(|r| r.recipients.is_empty()) {
            warn!("no notification channels configured, skipping alert");
            return DispatchOutcome::NoRoutes;
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for route in &routes {
            for recipient in &route.recipients {
                match route.channel.deliver(recipient, message).await {
                    Ok(()) => {
                        succeeded += 1;
                        debug!(channel = route.channel.name(), recipient = %recipient, "alert delivered");
                    }
                    Err(e) => {
                        failed += 1;
                        warn!(
                            channel = route.channel.name(),
                            recipient = %recipient,
                            error = %e,
                            "alert delivery failed"
                        );
                    }
                }
            }
        }

        if succeeded > 0 {
            sent.push_back(Instant::now());
            info!(succeeded, failed, "alert dispatched");
            DispatchOutcome::Delivered { succeeded, failed }
        } else {
            warn!(failed, "no alert delivered, all deliveries failed");
            DispatchOutcome::AllFailed { failed }
        }
    }
}

/// Drop timestamps that have left the rolling window.
fn prune(sent: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = sent.front() {
        if now.duration_since(*oldest) >= RATE_WINDOW {
            sent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records every delivery; fails for recipients listed in `failing`.
    struct RecordingChannel {
        deliveries: StdMutex<Vec<(String, String)>>,
        failing: Vec<String>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deliveries: StdMutex::new(Vec::new()),
                failing: Vec::new(),
            })
        }

        fn failing_for(recipients: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                deliveries: StdMutex::new(Vec::new()),
                failing: recipients.iter().map(|r| r.to_string()).collect(),
            })
        }

        fn count(&self) -> usize {
            self.deliveries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, recipient: &str, message: &str) -> Result<(), WardenError> {
            self.deliveries
                .lock()
                .unwrap()
                .push((recipient.to_string(), message.to_string()));
            if self.failing.iter().any(|r| r == recipient) {
                Err(WardenError::Delivery(format!("{recipient} unreachable")))
            } else {
                Ok(())
            }
        }
    }

    fn policy(max_per_hour: u32) -> DispatchPolicy {
        DispatchPolicy {
            max_per_hour,
            muted: false,
        }
    }

    fn dispatcher_with(channel: Arc<RecordingChannel>, recipients: &[&str], max: u32) -> AlertDispatcher {
        AlertDispatcher::new(
            vec![ChannelRoute::new(
                channel,
                recipients.iter().map(|r| r.to_string()).collect(),
            )],
            policy(max),
        )
    }

    #[tokio::test]
    async fn test_second_send_within_hour_rejected_at_one_per_hour() {
        let channel = RecordingChannel::new();
        let dispatcher = dispatcher_with(channel.clone(), &["ops"], 1);

        assert!(dispatcher.send("first").await);
        assert_eq!(channel.count(), 1);

        assert_eq!(dispatcher.dispatch("second").await, DispatchOutcome::RateLimited);
        assert_eq!(channel.count(), 1, "no delivery may be attempted when rate limited");
    }

    #[tokio::test]
    async fn test_f_plus_one_attempt_rejected() {
        let channel = RecordingChannel::new();
        let dispatcher = dispatcher_with(channel.clone(), &["ops"], 3);

        for i in 0..3 {
            assert!(dispatcher.send(&format!("alert {i}")).await);
        }
        assert!(!dispatcher.send("alert 3").await);
        assert_eq!(channel.count(), 3);
        assert_eq!(dispatcher.recent_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_after_an_hour() {
        let channel = RecordingChannel::new();
        let dispatcher = dispatcher_with(channel.clone(), &["ops"], 1);

        assert!(dispatcher.send("first").await);
        tokio::time::advance(Duration::from_secs(59 * 60)).await;
        assert!(!dispatcher.send("still inside window").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(dispatcher.send("window rolled").await);
        assert_eq!(channel.count(), 2);
    }

    #[tokio::test]
    async fn test_one_failing_recipient_does_not_block_others() {
        let channel = RecordingChannel::failing_for(&["bad"]);
        let dispatcher = dispatcher_with(channel.clone(), &["bad", "good"], 10);

        let outcome = dispatcher.dispatch("msg").await;
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(channel.count(), 2);
        assert_eq!(dispatcher.recent_count().await, 1);
    }

    #[tokio::test]
    async fn test_fan_out_across_channels() {
        let first = RecordingChannel::new();
        let second = RecordingChannel::failing_for(&["b"]);
        let dispatcher = AlertDispatcher::new(
            vec![
                ChannelRoute::new(first.clone(), vec!["a".to_string(), "b".to_string()]),
                ChannelRoute::new(second.clone(), vec!["a".to_string(), "b".to_string()]),
            ],
            policy(10),
        );

        assert!(dispatcher.send("msg").await);
        assert_eq!(first.count(), 2);
        assert_eq!(second.count(), 2);
        assert_eq!(dispatcher.recent_count().await, 1, "one timestamp per dispatch");
    }

    #[tokio::test]
    async fn test_all_failures_record_no_timestamp() {
        let channel = RecordingChannel::failing_for(&["ops"]);
        let dispatcher = dispatcher_with(channel.clone(), &["ops"], 1);

        assert_eq!(
            dispatcher.dispatch("msg").await,
            DispatchOutcome::AllFailed { failed: 1 }
        );
        assert_eq!(dispatcher.recent_count().await, 0);
        // Budget untouched, so the next attempt still goes out.
        assert_eq!(
            dispatcher.dispatch("msg").await,
            DispatchOutcome::AllFailed { failed: 1 }
        );
        assert_eq!(channel.count(), 2);
    }

    #[tokio::test]
    async fn test_muted_sends_nothing() {
        let channel = RecordingChannel::new();
        let dispatcher = AlertDispatcher::new(
            vec![ChannelRoute::new(channel.clone(), vec!["ops".to_string()])],
            DispatchPolicy {
                max_per_hour: 10,
                muted: true,
            },
        );
        assert_eq!(dispatcher.dispatch("msg").await, DispatchOutcome::Muted);
        assert_eq!(channel.count(), 0);
    }

    #[tokio::test]
    async fn test_no_routes() {
        let dispatcher = AlertDispatcher::new(Vec::new(), policy(10));
        assert_eq!(dispatcher.dispatch("msg").await, DispatchOutcome::NoRoutes);
        assert!(!dispatcher.send("msg").await);
    }

    #[tokio::test]
    async fn test_lowering_limit_applies_to_recorded_sends() {
        let channel = RecordingChannel::new();
        let dispatcher = dispatcher_with(channel.clone(), &["ops"], 5);
        assert!(dispatcher.send("a").await);
        assert!(dispatcher.send("b").await);

        dispatcher.set_policy(policy(2)).await;
        assert!(!dispatcher.send("c").await);
        assert_eq!(channel.count(), 2);
    }

    #[test]
    fn test_policy_from_alert_config() {
        let alerts = AlertConfig {
            max_per_hour: Some(0),
            muted: true,
            ..Default::default()
        };
        let policy = DispatchPolicy::from(&alerts);
        assert_eq!(policy.max_per_hour, 10);
        assert!(policy.muted);
    }

    #[test]
    fn test_routes_from_config() {
        let channels = vec![
            ChannelConfig {
                kind: ChannelKind::Log,
                url: None,
                auth_token: None,
                timeout_secs: 10,
                recipients: vec!["console".to_string()],
            },
            ChannelConfig {
                kind: ChannelKind::Webhook,
                url: Some("https://hooks.example.com/x".to_string()),
                auth_token: None,
                timeout_secs: 5,
                recipients: vec!["ops".to_string()],
            },
        ];
        let routes = routes_from_config(&channels).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].channel.name(), "log");
        assert_eq!(routes[1].channel.name(), "webhook");
    }

    #[test]
    fn test_routes_from_config_webhook_without_url() {
        let channels = vec![ChannelConfig {
            kind: ChannelKind::Webhook,
            url: None,
            auth_token: None,
            timeout_secs: 5,
            recipients: vec!["ops".to_string()],
        }];
        assert!(routes_from_config(&channels).is_err());
    }
}
