//! Value store backed by JSON documents on disk.
//!
//! The entry locator is the path of a JSON document whose top level is an
//! object; the value name is a key of that object. Values are exchanged as
//! text: strings verbatim, anything else in its JSON rendering. A write keeps
//! the JSON type of the value it replaces when the new text parses as JSON,
//! so a boolean flag stays a boolean after a rollback.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use warden_types::errors::WardenError;
use warden_types::model::EntryKey;
use warden_types::traits::ValueStore;

/// Reads and writes top-level values of JSON documents.
#[derive(Default)]
pub struct JsonFileStore {
    /// Resolves relative locators. `None` leaves them relative to the process.
    base_dir: Option<PathBuf>,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locators against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            write_lock: Mutex::new(()),
        }
    }

    fn document_path(&self, key: &EntryKey) -> PathBuf {
        let path = Path::new(&key.locator);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Load the document as an object. A missing file is `Ok(None)`.
    async fn load_document(&self, path: &Path) -> Result<Option<Map<String, Value>>, WardenError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WardenError::StoreIo(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(WardenError::StoreIo(format!(
                "{} is not a JSON object",
                path.display()
            ))),
            Err(e) => Err(WardenError::StoreIo(format!(
                "failed to parse {}: {e}",
                path.display()
            ))),
        }
    }

    /// Replace the document through a sibling temp file and a rename.
    async fn store_document(&self, path: &Path, map: Map<String, Value>) -> Result<(), WardenError> {
        let body = serde_json::to_string_pretty(&Value::Object(map))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let tmp = path.with_file_name(format!(".{file_name}.warden-tmp"));

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| WardenError::StoreIo(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| WardenError::StoreIo(format!("failed to replace {}: {e}", path.display())))?;
        Ok(())
    }
}

/// Text form of a JSON value.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON value to store for `text`, given the value it replaces.
fn coerce(text: &str, existing: Option<&Value>) -> Value {
    match existing {
        Some(Value::String(_)) | None => Value::String(text.to_string()),
        Some(_) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
    }
}

#[async_trait]
impl ValueStore for JsonFileStore {
    async fn read(&self, key: &EntryKey) -> Result<String, WardenError> {
        let path = self.document_path(key);
        let map = self
            .load_document(&path)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("{} does not exist", path.display())))?;
        map.get(&key.value_name)
            .map(render)
            .ok_or_else(|| WardenError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &EntryKey, value: &str) -> Result<(), WardenError> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(key);
        let mut map = self.load_document(&path).await?.unwrap_or_default();

        let new_value = coerce(value, map.get(&key.value_name));
        map.insert(key.value_name.clone(), new_value);
        self.store_document(&path, map).await?;

        debug!(key = %key, "value written");
        Ok(())
    }

    async fn exists(&self, key: &EntryKey) -> bool {
        self.read(key).await.is_ok()
    }
}
