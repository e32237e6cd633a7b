//! Credential and key store.
//!
//! The client persists its refresh token, E2EE key records and request
//! sequence counters through a [`CredentialStore`]. Keys are namespaced
//! strings (`e2eeKeys:{id}`, `e2eeGroupKeys:{chat}`, ...); values are text,
//! usually JSON.

pub mod file;
pub mod memory;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Async key-value persistence.
///
/// Implementations serialize their own writes.
pub trait CredentialStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;

    /// Removes `key`; removing a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Removes every key.
    fn clear(&self) -> BoxFuture<'_, Result<()>>;
}

/// Reads and deserializes a JSON value.
///
/// A value that fails to parse is treated as absent.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CredentialStore,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Ignoring unreadable store entry {}: {}", key, e);
            Ok(None)
        }
    }
}

/// Serializes and stores a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn CredentialStore,
    key: &str,
    value: &T,
) -> Result<()> {
    store.set(key, serde_json::to_string(value)?).await
}

/// Store key names.
pub mod keys {
    pub const REFRESH_TOKEN: &str = "refreshToken";
    pub const EXPIRE: &str = "expire";
    pub const REQSEQ: &str = "reqseq";
    pub const QR_CERT: &str = "qrCert";

    /// Self key record by owner mid or by key id.
    pub fn self_key(id: impl std::fmt::Display) -> String {
        format!("e2eeKeys:{}", id)
    }

    /// Cached peer public key by key id.
    pub fn public_key(key_id: i32) -> String {
        format!("e2eePublicKeys:{}", key_id)
    }

    /// Group key record by chat mid.
    pub fn group_key(chat_mid: &str) -> String {
        format!("e2eeGroupKeys:{}", chat_mid)
    }
}
