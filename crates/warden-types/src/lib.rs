/// Shared types, traits, and errors for the Warden configuration monitor.
///
/// This crate is the foundation that all other Warden crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) for the injected collaborators: value store,
///   audit log, notification channel, entry source
/// - **Shared data types** (`model`) for entries, audit records, and events
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`, `config_loader`, `entry_source`) for
///   settings and entry-list parsing and hot reload
pub mod config;
pub mod config_loader;
pub mod entry_source;
pub mod errors;
pub mod model;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use errors::WardenError;
pub use model::*;
pub use traits::*;
