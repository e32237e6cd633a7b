//! Per-login session state.
//!
//! Holds the access token, the logged-in mid and the request sequence
//! counters. The token is a plain replace-in-place value; concurrent
//! rotations are last-writer-wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::error::{ClientError, Result};
use crate::storage::{self, keys, CredentialStore};

/// Shared session state.
pub struct Session {
    token: RwLock<Option<String>>,
    mid: RwLock<Option<String>>,
    reqseqs: Mutex<Option<HashMap<String, i64>>>,
    store: Arc<dyn CredentialStore>,
}

impl Session {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            token: RwLock::new(None),
            mid: RwLock::new(None),
            reqseqs: Mutex::new(None),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// The current access token, if logged in.
    pub fn auth_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth_token().is_some()
    }

    /// The logged-in user's mid.
    pub fn mid(&self) -> Option<String> {
        self.mid.read().ok().and_then(|m| m.clone())
    }

    /// The logged-in user's mid, or `NotLoggedIn`.
    pub fn require_mid(&self) -> Result<String> {
        self.mid().ok_or(ClientError::NotLoggedIn)
    }

    pub fn set_mid(&self, mid: Option<String>) {
        match self.mid.write() {
            Ok(mut slot) => *slot = mid,
            Err(poisoned) => *poisoned.into_inner() = mid,
        }
    }

    /// Forgets the token and mid. Stored credentials are kept.
    pub fn clear(&self) {
        self.set_auth_token(None);
        self.set_mid(None);
    }

    /// Returns the current sequence number for `name` and advances it.
    ///
    /// Counters start at 0 and are persisted under `reqseq` after every call.
    pub async fn next_reqseq(&self, name: &str) -> Result<i64> {
        let mut guard = self.reqseqs.lock().await;
        if guard.is_none() {
            let stored: Option<HashMap<String, i64>> =
                storage::get_json(self.store.as_ref(), keys::REQSEQ).await?;
            *guard = Some(stored.unwrap_or_default());
        }
        let counters = guard.get_or_insert_with(HashMap::new);
        let counter = counters.entry(name.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        storage::set_json(self.store.as_ref(), keys::REQSEQ, &*counters).await?;
        Ok(seq)
    }

    pub async fn refresh_token(&self) -> Result<Option<String>> {
        self.store.get(keys::REFRESH_TOKEN).await
    }

    pub async fn set_refresh_token(&self, token: &str) -> Result<()> {
        self.store.set(keys::REFRESH_TOKEN, token.to_string()).await
    }

    /// Records the access token expiry (epoch seconds).
    pub async fn set_expire(&self, epoch_secs: i64) -> Result<()> {
        self.store.set(keys::EXPIRE, epoch_secs.to_string()).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("logged_in", &self.is_logged_in())
            .field("mid", &self.mid())
            .finish()
    }
}
