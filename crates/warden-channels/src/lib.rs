/// Notification delivery for the Warden monitor.
///
/// - **Dispatcher**: rate-limited fan-out of one alert to every channel and recipient
/// - **Webhook**: JSON POST channel for HTTP endpoints
/// - **Log**: tracing-only channel
pub mod dispatcher;
pub mod log;
pub mod webhook;

pub use dispatcher::{
    routes_from_config, AlertDispatcher, ChannelRoute, DispatchOutcome, DispatchPolicy,
};
pub use log::LogChannel;
pub use webhook::{WebhookChannel, WebhookConfig};
