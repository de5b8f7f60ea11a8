/// Persistence backends for the Warden monitor.
///
/// - **Memory**: process-lifetime audit log
/// - **SQLite**: durable audit log via sqlx
/// - **JSON file**: reference `ValueStore` over JSON documents
pub mod json_file;
pub mod memory;
pub mod sqlite;

pub use json_file::JsonFileStore;
pub use memory::MemoryAuditLog;
pub use sqlite::SqliteAuditLog;
