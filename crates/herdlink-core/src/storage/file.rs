use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::KeyValueStore;
use crate::error::{GatewayError, Result};

/// On-disk record. The key is stored alongside the value because file
/// names are hashes.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: Value,
}

/// File-backed store: one JSON file per key.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// leaves either the old or the new record, never a torn one.
pub struct FileStore {
    dir: PathBuf,
}

fn storage_err(context: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(format!("{}: {}", context, err))
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("Failed to create store directory", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    async fn read_record(path: &Path) -> Result<Option<StoredRecord>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_err("Failed to read store record", e)),
        };
        let record = serde_json::from_str(&contents)
            .map_err(|e| storage_err("Failed to parse store record", e))?;
        Ok(Some(record))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let record = Self::read_record(&self.record_path(key)).await?;
        Ok(record.filter(|r| r.key == key).map(|r| r.value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.record_path(key);
        let tmp = path.with_extension("json.tmp");
        let record = StoredRecord {
            key: key.to_string(),
            value,
        };
        let contents = serde_json::to_vec(&record)?;
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| storage_err("Failed to write store record", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_err("Failed to commit store record", e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("Failed to remove store record", e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_err("Failed to list store directory", e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("Failed to list store directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) if record.key.starts_with(prefix) => keys.push(record.key),
                Ok(_) => {}
                Err(e) => {
                    // A corrupt record must not hide every other key.
                    debug!(path = %path.display(), error = %e, "Skipping unreadable store record");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
