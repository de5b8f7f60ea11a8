/// Detection, rollback and alert orchestration for the Warden monitor.
///
/// - **Registry**: the ordered, reloadable set of monitored entries
/// - **Rollback**: restore-on-drift and the approval protocol
/// - **Monitor**: the scan loop worker and its control handle
pub mod monitor;
pub mod registry;
pub mod rollback;

pub use monitor::{Monitor, MonitorConfig, MonitorDeps};
pub use registry::{EntryRegistry, MonitoredEntry};
pub use rollback::{RollbackEngine, RollbackOutcome};
