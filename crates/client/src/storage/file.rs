//! JSON file credential store.
//!
//! The whole store is one JSON object of string values. Every mutation
//! rewrites the file atomically (temp file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use super::CredentialStore;
use crate::error::{ClientError, Result};

/// Persistent store backed by a JSON file.
pub struct FileStore {
    /// The path to the JSON file.
    path: PathBuf,
    /// Current contents.
    entries: RwLock<BTreeMap<String, String>>,
    /// Serializes file writes.
    write_lock: Mutex<()>,
}

fn lock_error(what: &str) -> ClientError {
    ClientError::Storage(format!("Failed to acquire {} lock on file store", what))
}

impl FileStore {
    /// Opens the store at `path`, loading existing contents.
    ///
    /// A missing file starts empty. An unreadable or corrupt file also starts
    /// empty and is overwritten on the next write.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Discarding corrupt store {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Store file not found at {:?}, starting empty", path);
                BTreeMap::new()
            }
            Err(e) => {
                return Err(ClientError::Storage(format!(
                    "Failed to read store {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the path to the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| lock_error("write"))?;
        f(&mut entries);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let contents = {
            let entries = self.entries.read().map_err(|_| lock_error("read"))?;
            serde_json::to_string_pretty(&*entries)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ClientError::Storage(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents).await.map_err(|e| {
            ClientError::Storage(format!(
                "Failed to write temp store {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| {
                ClientError::Storage(format!(
                    "Failed to rename temp store {} to {}: {}",
                    temp_path.display(),
                    self.path.display(),
                    e
                ))
            })
    }
}

impl CredentialStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().map_err(|_| lock_error("read"))?;
            Ok(entries.get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.mutate(|entries| {
                entries.insert(key.to_string(), value);
            })?;
            self.persist().await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.mutate(|entries| {
                entries.remove(key);
            })?;
            self.persist().await
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.mutate(BTreeMap::clear)?;
            self.persist().await
        })
    }
}
