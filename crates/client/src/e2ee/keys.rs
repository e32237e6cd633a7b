//! Persisted E2EE key records.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use protocol::crypto::KeyPair;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ClientError, Result};
use crate::storage::{self, keys, CredentialStore};

/// Accepts a key id stored either as a JSON number or a numeric string.
fn flexible_i32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i32, D::Error> {
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("key id out of range: {}", n))),
        serde_json::Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("invalid key id: {}", other))),
    }
}

/// Accepts a version stored either as a JSON number or a string.
fn flexible_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| ClientError::Storage(format!("invalid base64 in stored {}: {}", what, e)))
}

/// One of our own key pairs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfKeyRecord {
    #[serde(deserialize_with = "flexible_i32")]
    pub key_id: i32,
    pub priv_key: String,
    pub pub_key: String,
    #[serde(default, deserialize_with = "flexible_string")]
    pub e2ee_version: String,
}

impl SelfKeyRecord {
    pub fn new(key_id: i32, pair: &KeyPair, e2ee_version: impl Into<String>) -> Self {
        Self {
            key_id,
            priv_key: BASE64.encode(pair.private_key()),
            pub_key: BASE64.encode(pair.public_key()),
            e2ee_version: e2ee_version.into(),
        }
    }

    pub fn private_key(&self) -> Result<Vec<u8>> {
        decode_b64(&self.priv_key, "private key")
    }

    pub fn public_key(&self) -> Result<Vec<u8>> {
        decode_b64(&self.pub_key, "public key")
    }

    /// A record is usable when both halves are present.
    pub fn is_complete(&self) -> bool {
        !self.priv_key.is_empty() && !self.pub_key.is_empty()
    }
}

impl std::fmt::Debug for SelfKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfKeyRecord")
            .field("key_id", &self.key_id)
            .field("pub_key", &self.pub_key)
            .field("priv_key", &"[REDACTED]")
            .field("e2ee_version", &self.e2ee_version)
            .finish()
    }
}

/// The shared private scalar of one group chat.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKeyRecord {
    pub priv_key: String,
    #[serde(deserialize_with = "flexible_i32")]
    pub key_id: i32,
}

impl GroupKeyRecord {
    pub fn new(private_key: &[u8], key_id: i32) -> Self {
        Self {
            priv_key: BASE64.encode(private_key),
            key_id,
        }
    }

    pub fn private_key(&self) -> Result<Vec<u8>> {
        decode_b64(&self.priv_key, "group key")
    }
}

impl std::fmt::Debug for GroupKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyRecord")
            .field("key_id", &self.key_id)
            .field("priv_key", &"[REDACTED]")
            .finish()
    }
}

/// Typed access to the key entries of a credential store.
#[derive(Clone)]
pub struct KeyStore {
    store: Arc<dyn CredentialStore>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Our key record saved under our own mid.
    pub async fn self_key_for_owner(&self, mid: &str) -> Result<Option<SelfKeyRecord>> {
        let record: Option<SelfKeyRecord> = storage::get_json(self.store.as_ref(), &keys::self_key(mid)).await?;
        Ok(record.filter(SelfKeyRecord::is_complete))
    }

    pub async fn self_key_by_id(&self, key_id: i32) -> Result<Option<SelfKeyRecord>> {
        storage::get_json(self.store.as_ref(), &keys::self_key(key_id)).await
    }

    /// Saves a record under its key id and, when given, under the owner mid.
    pub async fn save_self_key(&self, record: &SelfKeyRecord, owner: Option<&str>) -> Result<()> {
        storage::set_json(self.store.as_ref(), &keys::self_key(record.key_id), record).await?;
        if let Some(mid) = owner {
            storage::set_json(self.store.as_ref(), &keys::self_key(mid), record).await?;
        }
        Ok(())
    }

    pub async fn cached_public_key(&self, key_id: i32) -> Result<Option<Vec<u8>>> {
        match self.store.get(&keys::public_key(key_id)).await? {
            Some(encoded) if !encoded.is_empty() => Ok(Some(decode_b64(&encoded, "peer key")?)),
            _ => Ok(None),
        }
    }

    pub async fn cache_public_key(&self, key_id: i32, key: &[u8]) -> Result<()> {
        self.store.set(&keys::public_key(key_id), BASE64.encode(key)).await
    }

    pub async fn forget_public_key(&self, key_id: i32) -> Result<()> {
        self.store.delete(&keys::public_key(key_id)).await
    }

    pub async fn group_key(&self, chat_mid: &str) -> Result<Option<GroupKeyRecord>> {
        storage::get_json(self.store.as_ref(), &keys::group_key(chat_mid)).await
    }

    pub async fn save_group_key(&self, chat_mid: &str, record: &GroupKeyRecord) -> Result<()> {
        storage::set_json(self.store.as_ref(), &keys::group_key(chat_mid), record).await
    }

    pub async fn delete_group_key(&self, chat_mid: &str) -> Result<()> {
        self.store.delete(&keys::group_key(chat_mid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_self_key_record_json_shape() {
        let pair = KeyPair::generate();
        let record = SelfKeyRecord::new(7, &pair, "1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["keyId"], 7);
        assert_eq!(json["e2eeVersion"], "1");
        assert_eq!(record.private_key().unwrap(), pair.private_key().to_vec());
        assert_eq!(record.public_key().unwrap(), pair.public_key().to_vec());
    }

    #[test]
    fn test_record_accepts_string_key_id_and_numeric_version() {
        let record: SelfKeyRecord =
            serde_json::from_str(r#"{"keyId":"12","privKey":"AA==","pubKey":"AA==","e2eeVersion":1}"#).unwrap();
        assert_eq!(record.key_id, 12);
        assert_eq!(record.e2ee_version, "1");

        let group: GroupKeyRecord = serde_json::from_str(r#"{"privKey":"AA==","keyId":"3"}"#).unwrap();
        assert_eq!(group.key_id, 3);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let record = GroupKeyRecord::new(&[9u8; 32], 1);
        assert!(!format!("{:?}", record).contains(&record.priv_key));
        let pair = KeyPair::generate();
        let record = SelfKeyRecord::new(1, &pair, "1");
        assert!(!format!("{:?}", record).contains(&record.priv_key));
    }

    #[tokio::test]
    async fn test_key_store_round_trip() {
        let store = KeyStore::new(Arc::new(MemoryStore::new()));
        let record = SelfKeyRecord::new(5, &KeyPair::generate(), "1");
        store.save_self_key(&record, Some("u-me")).await.unwrap();
        assert_eq!(store.self_key_by_id(5).await.unwrap(), Some(record.clone()));
        assert_eq!(store.self_key_for_owner("u-me").await.unwrap(), Some(record));

        store.cache_public_key(9, &[1, 2, 3]).await.unwrap();
        assert_eq!(store.cached_public_key(9).await.unwrap(), Some(vec![1, 2, 3]));
        store.forget_public_key(9).await.unwrap();
        assert_eq!(store.cached_public_key(9).await.unwrap(), None);

        let group = GroupKeyRecord::new(&[4u8; 32], 2);
        store.save_group_key("c1", &group).await.unwrap();
        assert_eq!(store.group_key("c1").await.unwrap(), Some(group));
        store.delete_group_key("c1").await.unwrap();
        assert_eq!(store.group_key("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incomplete_owner_record_is_ignored() {
        let store = Arc::new(MemoryStore::with_entries([(
            "e2eeKeys:u-me",
            r#"{"keyId":1,"privKey":"","pubKey":"AA=="}"#,
        )]));
        let keys = KeyStore::new(store);
        assert_eq!(keys.self_key_for_owner("u-me").await.unwrap(), None);
    }
}
