//! End-to-end encryption engine.
//!
//! Handles our own key pair, peer public key negotiation, group key
//! distribution, and message encryption/decryption. Individual chats use
//! X25519 between our key and the peer's key; group chats use a shared group
//! scalar that is wrapped for each member and registered with the server.
//!
//! # Decryption failures
//!
//! A tag mismatch is never ignored. For group messages the sender's public
//! key is re-fetched once, bypassing the cache; if the second attempt also
//! fails a fresh group key is registered (at most once per chat every 30 s)
//! and the original error is returned. The message itself stays unreadable.

pub mod keys;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use protocol::crypto::{self, AadContext, KeyPair, MessageChunks};
use protocol::{ProtocolError, ProtocolKind};
use serde_json::json;
use tokio::time::Instant;

use crate::error::{ClientError, Result};
use crate::models::{
    to_type_of, E2eePublicKey, Location, MidType, TalkMessage, CONTENT_TYPE_LOCATION, CONTENT_TYPE_NONE,
};
use crate::services::TalkService;
use crate::session::Session;

pub use keys::{GroupKeyRecord, KeyStore, SelfKeyRecord};

/// Spec version used when the peer does not say otherwise.
pub const DEFAULT_SPEC_VERSION: i32 = 2;

/// Group key version requested from the server.
const GROUP_KEY_VERSION: i32 = 2;

/// Version of key pairs we generate.
const SELF_KEY_VERSION: i32 = 1;

/// Service error code for "not found".
const NOT_FOUND_CODE: i32 = 5;

/// Minimum interval between group key re-registrations for one chat.
pub const MIN_GROUP_KEY_REGISTRATION_INTERVAL: Duration = Duration::from_secs(30);

/// Plaintext of an encrypted message.
#[derive(Debug, Clone, PartialEq)]
pub enum E2eePayload {
    Text(String),
    Location(Location),
}

impl E2eePayload {
    fn to_json(&self) -> Result<Vec<u8>> {
        let value = match self {
            E2eePayload::Text(text) => json!({ "text": text }),
            E2eePayload::Location(location) => json!({ "location": location }),
        };
        Ok(serde_json::to_vec(&value)?)
    }

    /// Content type bound into the AAD.
    fn aad_content_type(&self, content_type: i32) -> i32 {
        match self {
            E2eePayload::Text(_) => CONTENT_TYPE_NONE,
            E2eePayload::Location(_) => content_type,
        }
    }
}

fn is_mac_failure(err: &ClientError) -> bool {
    matches!(err, ClientError::E2eeDecryption(_))
}

fn is_not_found(err: &ClientError) -> bool {
    if err.service_code() == Some(NOT_FOUND_CODE) {
        return true;
    }
    let text = err.to_string().to_lowercase();
    text.contains("not_found") || text.contains("not found")
}

fn decryption_error(err: ProtocolError) -> ClientError {
    ClientError::E2eeDecryption(err.to_string())
}

/// The E2EE engine.
pub struct E2eeEngine {
    talk: Arc<TalkService>,
    session: Arc<Session>,
    keys: KeyStore,
    recent_registrations: DashMap<String, Instant>,
    min_registration_interval: Duration,
}

impl E2eeEngine {
    pub fn new(talk: Arc<TalkService>, session: Arc<Session>) -> Self {
        let keys = KeyStore::new(session.store().clone());
        Self {
            talk,
            session,
            keys,
            recent_registrations: DashMap::new(),
            min_registration_interval: MIN_GROUP_KEY_REGISTRATION_INTERVAL,
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Our current key record.
    ///
    /// Looks under our mid first, then for any server-registered key id we
    /// hold locally.
    pub async fn self_key(&self) -> Result<SelfKeyRecord> {
        let mid = self.session.require_mid()?;
        if let Some(record) = self.keys.self_key_for_owner(&mid).await? {
            return Ok(record);
        }

        for key in self.talk.get_e2ee_public_keys().await? {
            if let Some(record) = self.keys.self_key_by_id(key.key_id).await? {
                self.keys.save_self_key(&record, Some(&mid)).await?;
                return Ok(record);
            }
        }
        Err(ClientError::NoE2eeKey)
    }

    /// Makes sure the server holds the public half of a key pair we own.
    ///
    /// Returns true if a key was (re-)registered.
    pub async fn verify_and_sync(&self) -> Result<bool> {
        self.session.require_mid()?;

        let server_keys = self.talk.get_e2ee_public_keys().await?;
        let Some(server_key) = server_keys.first() else {
            tracing::debug!("No E2EE key registered on server, generating one");
            return self.generate_and_register().await;
        };

        let Some(local) = self.keys.self_key_by_id(server_key.key_id).await? else {
            tracing::warn!(
                "No local key for server key id {}, generating a new key",
                server_key.key_id
            );
            return self.generate_and_register().await;
        };

        let derived = crypto::public_key_from_private(&local.private_key()?)?;
        if derived.as_slice() != local.public_key()?.as_slice() {
            tracing::error!("Stored key pair {} is inconsistent, generating a new key", local.key_id);
            return self.generate_and_register().await;
        }

        if derived.as_slice() != server_key.key_data.as_slice() {
            tracing::warn!("Local public key differs from server, registering local key");
            return self.register_local(local).await;
        }

        tracing::debug!("E2EE key {} verified", server_key.key_id);
        Ok(false)
    }

    async fn generate_and_register(&self) -> Result<bool> {
        let pair = KeyPair::generate();
        let req_seq = self.talk.next_reqseq().await?;
        let key_id = i32::try_from(req_seq)
            .map_err(|_| ClientError::MalformedResponse(format!("key id {} overflows i32", req_seq)))?;
        let key = E2eePublicKey {
            version: SELF_KEY_VERSION,
            key_id,
            key_data: pair.public_key().to_vec(),
            created_time: Some(now_millis()),
        };

        let registered = self.talk.register_e2ee_public_key(req_seq, &key).await?;
        let registered_id = registered.map(|k| k.key_id).unwrap_or(key_id);

        let record = SelfKeyRecord::new(registered_id, &pair, SELF_KEY_VERSION.to_string());
        let mid = self.session.mid();
        self.keys.save_self_key(&record, mid.as_deref()).await?;
        tracing::info!("Registered new E2EE key {}", registered_id);
        Ok(true)
    }

    async fn register_local(&self, mut local: SelfKeyRecord) -> Result<bool> {
        let req_seq = self.talk.next_reqseq().await?;
        let key = E2eePublicKey {
            version: SELF_KEY_VERSION,
            key_id: local.key_id,
            key_data: local.public_key()?,
            created_time: Some(now_millis()),
        };
        let registered = self.talk.register_e2ee_public_key(req_seq, &key).await?;
        let registered_id = registered.map(|k| k.key_id).unwrap_or(local.key_id);
        tracing::info!("Registered local E2EE key {}", registered_id);

        if registered_id != local.key_id {
            local.key_id = registered_id;
            let mid = self.session.mid();
            self.keys.save_self_key(&local, mid.as_deref()).await?;
        }
        Ok(true)
    }

    /// Public key of user `mid`.
    ///
    /// With `key_id` the cached key is used unless `skip_cache` is set, in
    /// which case the cache entry is dropped first. A negotiated key whose id
    /// differs from `key_id` is an error: the peer has rotated away from it.
    pub async fn peer_public_key(&self, mid: &str, key_id: Option<i32>, skip_cache: bool) -> Result<Vec<u8>> {
        if let Some(id) = key_id {
            if skip_cache {
                self.keys.forget_public_key(id).await?;
            } else if let Some(cached) = self.keys.cached_public_key(id).await? {
                return Ok(cached);
            }
        }

        let negotiated = self.talk.negotiate_e2ee_public_key(mid).await?;
        if !negotiated.is_supported() {
            return Err(ClientError::E2eeUnsupported { mid: mid.to_string() });
        }
        let public_key = negotiated
            .public_key
            .ok_or_else(|| ClientError::MalformedResponse(format!("no public key negotiated for {}", mid)))?;

        if let Some(requested) = key_id {
            if public_key.key_id != requested {
                return Err(ClientError::E2eeKeyMismatch {
                    mid: mid.to_string(),
                    requested,
                    current: public_key.key_id,
                });
            }
        }

        self.keys
            .cache_public_key(public_key.key_id, &public_key.key_data)
            .await?;
        Ok(public_key.key_data)
    }

    /// Group key of `chat_mid`, fetching, unwrapping or creating it as needed.
    pub async fn group_key(&self, chat_mid: &str, key_id: Option<i32>) -> Result<GroupKeyRecord> {
        if let Some(stored) = self.keys.group_key(chat_mid).await? {
            match key_id {
                Some(id) if id != stored.key_id => {}
                _ => return Ok(stored),
            }
        }

        let mut shared = None;
        if let Some(id) = key_id {
            match self.talk.get_e2ee_group_shared_key(GROUP_KEY_VERSION, chat_mid, id).await {
                Ok(key) => shared = Some(key),
                Err(e) => tracing::debug!("Group key {} unavailable, falling back to latest: {}", id, e),
            }
        }
        let shared = match shared {
            Some(key) => key,
            None => match self.talk.get_last_e2ee_group_shared_key(GROUP_KEY_VERSION, chat_mid).await {
                Ok(key) => key,
                Err(e) if is_not_found(&e) => {
                    tracing::debug!("No group key for {}, registering one", chat_mid);
                    return self.register_group_key(chat_mid).await;
                }
                Err(e) => return Err(e),
            },
        };

        let Some(self_key) = self.keys.self_key_by_id(shared.receiver_key_id).await? else {
            tracing::debug!(
                "Group key wrapped for unknown key id {}, registering a new group key",
                shared.receiver_key_id
            );
            return self.register_group_key(chat_mid).await;
        };
        let private = self_key.private_key()?;

        for skip_cache in [false, true] {
            let attempt = async {
                let creator_key = self
                    .peer_public_key(&shared.creator, Some(shared.creator_key_id), skip_cache)
                    .await?;
                let secret = crypto::shared_secret(&private, &creator_key)?;
                Ok::<_, ClientError>(crypto::unwrap_key(&secret, &shared.encrypted_shared_key)?)
            };
            match attempt.await {
                Ok(group_private) => {
                    let record = GroupKeyRecord::new(&group_private, shared.group_key_id);
                    self.keys.save_group_key(chat_mid, &record).await?;
                    return Ok(record);
                }
                Err(e) => tracing::debug!(
                    "Unwrapping group key for {} failed (fresh creator key: {}): {}",
                    chat_mid,
                    skip_cache,
                    e
                ),
            }
        }

        self.register_group_key(chat_mid).await
    }

    /// Creates a fresh group key, wraps it for every member and registers it.
    pub async fn register_group_key(&self, chat_mid: &str) -> Result<GroupKeyRecord> {
        let member_keys = self.talk.get_last_e2ee_public_keys(chat_mid).await?;
        if member_keys.is_empty() {
            return Err(ClientError::MalformedResponse(format!(
                "no E2EE public keys for members of {}",
                chat_mid
            )));
        }

        let mid = self.session.require_mid()?;
        let own = member_keys.get(&mid).ok_or(ClientError::NoE2eeKey)?;
        let self_key = self
            .keys
            .self_key_by_id(own.key_id)
            .await?
            .ok_or(ClientError::NoE2eeKey)?;
        let private = self_key.private_key()?;

        let group_private = crypto::random_bytes::<{ crypto::KEY_LENGTH }>();
        let key_version = member_keys
            .values()
            .map(|k| k.version)
            .fold(GROUP_KEY_VERSION, i32::min);

        let mut members = Vec::with_capacity(member_keys.len());
        let mut key_ids = Vec::with_capacity(member_keys.len());
        let mut wrapped = Vec::with_capacity(member_keys.len());
        for (member, key) in &member_keys {
            if key.key_data.is_empty() {
                continue;
            }
            let secret = crypto::shared_secret(&private, &key.key_data)?;
            wrapped.push(crypto::wrap_key(&secret, &group_private)?);
            members.push(member.clone());
            key_ids.push(key.key_id);
        }

        let group_key_id = match self
            .talk
            .register_e2ee_group_key(key_version, chat_mid, members, key_ids, wrapped)
            .await?
        {
            Some(id) => id,
            None => {
                tracing::warn!("registerE2EEGroupKey reply has no group key id for {}", chat_mid);
                0
            }
        };

        let record = GroupKeyRecord::new(&group_private, group_key_id);
        self.keys.save_group_key(chat_mid, &record).await?;
        tracing::info!("Registered group key {} (version {}) for {}", group_key_id, key_version, chat_mid);
        Ok(record)
    }

    /// Encrypts a payload for `to`; returns the five wire chunks.
    pub async fn encrypt(&self, to: &str, payload: &E2eePayload, content_type: i32) -> Result<Vec<Vec<u8>>> {
        let from = self.session.require_mid()?;
        let self_key = self.self_key().await?;

        let (secret, receiver_key_id, spec_version) = if MidType::from_mid(to) == Some(MidType::User) {
            let negotiated = self.talk.negotiate_e2ee_public_key(to).await?;
            let spec_version = negotiated.spec_version.unwrap_or(DEFAULT_SPEC_VERSION);
            if spec_version == -1 {
                return Err(ClientError::E2eeUnsupported { mid: to.to_string() });
            }
            let peer = negotiated
                .public_key
                .ok_or_else(|| ClientError::MalformedResponse(format!("no public key negotiated for {}", to)))?;
            let secret = crypto::shared_secret(&self_key.private_key()?, &peer.key_data)?;
            (secret, peer.key_id, spec_version)
        } else {
            let group = self.group_key(to, None).await?;
            let secret = crypto::shared_secret(&group.private_key()?, &self_key.public_key()?)?;
            (secret, group.key_id, DEFAULT_SPEC_VERSION)
        };

        let aad = AadContext {
            to,
            from: &from,
            sender_key_id: self_key.key_id,
            receiver_key_id,
            spec_version,
            content_type: payload.aad_content_type(content_type),
        };
        let sealed = crypto::seal_message(&secret, &aad, &payload.to_json()?)?;
        Ok(sealed.to_chunks())
    }

    /// Decrypts an encrypted talk message in place.
    ///
    /// Text messages get their text and any extra payload fields (merged into
    /// the content metadata); location messages get their location. Other
    /// content types, and messages without chunks, are left untouched.
    pub async fn decrypt_message(&self, message: &mut TalkMessage) -> Result<()> {
        if message.data.chunks.is_empty() {
            return Ok(());
        }
        if !matches!(message.data.content_type, CONTENT_TYPE_NONE | CONTENT_TYPE_LOCATION) {
            tracing::debug!(
                "Not decrypting message {} with content type {}",
                message.data.id,
                message.data.content_type
            );
            return Ok(());
        }
        let payload = self.open(message).await?;

        if message.data.content_type == CONTENT_TYPE_LOCATION {
            if let Some(location) = payload.get("location") {
                message.data.location = Some(serde_json::from_value(location.clone())?);
            }
        } else {
            let text = payload
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            message.data.text = Some(text);
            if let Some(fields) = payload.as_object() {
                for (key, value) in fields.iter().filter(|(k, _)| k.as_str() != "text") {
                    let value = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    message.data.content_metadata.insert(key.clone(), value);
                }
            }
        }
        Ok(())
    }

    async fn open(&self, message: &TalkMessage) -> Result<serde_json::Value> {
        let me = self.session.require_mid()?;
        let data = &message.data;
        let chunks = MessageChunks::from_chunks(&data.chunks[..]).map_err(decryption_error)?;
        let is_self = data.from == me;
        let is_direct = data.to_type == MidType::User.as_i32();
        let spec_version = data
            .content_metadata
            .get("e2eeVersion")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SPEC_VERSION);
        let aad = AadContext {
            to: &data.to,
            from: &data.from,
            sender_key_id: chunks.sender_key_id,
            receiver_key_id: chunks.receiver_key_id,
            spec_version,
            content_type: data.content_type,
        };

        let self_key = self.self_key().await?;

        let (private, public) = if is_direct {
            let (peer, peer_key_id) = if is_self {
                (&data.to, chunks.receiver_key_id)
            } else {
                (&data.from, chunks.sender_key_id)
            };
            let public = self.peer_public_key(peer, Some(peer_key_id), false).await?;
            (self_key.private_key()?, public)
        } else {
            let group = self.group_key(&data.to, Some(chunks.receiver_key_id)).await?;
            let public = if is_self {
                self_key.public_key()?
            } else {
                self.peer_public_key(&data.from, Some(chunks.sender_key_id), false)
                    .await?
            };
            (group.private_key()?, public)
        };

        let first = open_with(&private, &public, &aad, &chunks);
        let plaintext = match first {
            Err(err) if is_mac_failure(&err) && !is_self && !is_direct => {
                tracing::debug!("Decryption failed, retrying with a fresh sender key");
                let public = self
                    .peer_public_key(&data.from, Some(chunks.sender_key_id), true)
                    .await?;
                match open_with(&private, &public, &aad, &chunks) {
                    Ok(plaintext) => plaintext,
                    Err(retry_err) => {
                        if is_mac_failure(&retry_err) {
                            self.reregister_after_failure(&data.to).await;
                        }
                        return Err(retry_err);
                    }
                }
            }
            other => other?,
        };

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Registers a fresh group key after an unreadable message, at most once
    /// per chat per interval.
    async fn reregister_after_failure(&self, chat_mid: &str) {
        let now = Instant::now();
        if let Some(last) = self.recent_registrations.get(chat_mid) {
            if now.duration_since(*last) < self.min_registration_interval {
                tracing::debug!("Group key for {} was re-registered recently, skipping", chat_mid);
                return;
            }
        }

        if let Err(e) = self.keys.delete_group_key(chat_mid).await {
            tracing::debug!("Failed to drop cached group key for {}: {}", chat_mid, e);
        }
        match self.register_group_key(chat_mid).await {
            Ok(_) => {
                self.recent_registrations.insert(chat_mid.to_string(), now);
                tracing::debug!("Registered a new group key for {} after decryption failure", chat_mid);
            }
            Err(e) => tracing::debug!("Group key re-registration for {} failed: {}", chat_mid, e),
        }
    }

    /// Unwraps the key chain delivered by an E2EE login and stores it as our
    /// key record.
    pub async fn decode_key_chain(
        &self,
        login_key: &KeyPair,
        login: &E2eeLoginKeyChain,
    ) -> Result<SelfKeyRecord> {
        let server_public = BASE64
            .decode(&login.public_key)
            .map_err(|e| ClientError::MalformedResponse(format!("invalid login public key: {}", e)))?;
        let key_chain = BASE64
            .decode(&login.encrypted_key_chain)
            .map_err(|e| ClientError::MalformedResponse(format!("invalid key chain: {}", e)))?;

        let (private, public) = decrypt_key_chain(login_key.private_key(), &server_public, &key_chain)?;
        let pair = KeyPair::from_private(&private)?;
        if pair.public_key().as_slice() != public.as_slice() {
            tracing::warn!("Key chain public key does not match its private key");
        }

        let record = SelfKeyRecord {
            key_id: login.key_id,
            priv_key: BASE64.encode(&private),
            pub_key: BASE64.encode(&public),
            e2ee_version: login.e2ee_version.clone(),
        };
        self.keys.save_self_key(&record, None).await?;
        Ok(record)
    }
}

fn open_with(private: &[u8], public: &[u8], aad: &AadContext<'_>, chunks: &MessageChunks) -> Result<Vec<u8>> {
    let secret = crypto::shared_secret(private, public)?;
    crypto::open_message(&secret, aad, chunks).map_err(decryption_error)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Key chain fields returned by an E2EE login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eeLoginKeyChain {
    pub key_id: i32,
    /// Base64 server public key.
    pub public_key: String,
    /// Base64 encrypted key chain.
    pub encrypted_key_chain: String,
    pub e2ee_version: String,
}

impl E2eeLoginKeyChain {
    /// Reads the key chain out of login metadata; `None` unless an encrypted
    /// key chain is present.
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Option<Self> {
        let encrypted_key_chain = metadata.get("encryptedKeyChain").filter(|v| !v.is_empty())?;
        Some(Self {
            key_id: metadata.get("keyId").and_then(|v| v.parse().ok()).unwrap_or(0),
            public_key: metadata.get("publicKey").cloned().unwrap_or_default(),
            encrypted_key_chain: encrypted_key_chain.clone(),
            e2ee_version: metadata.get("e2eeVersion").cloned().unwrap_or_default(),
        })
    }
}

/// Creates the secret for a QR login: a fresh key pair and the query string
/// `?secret={urlencoded base64 public key}&e2eeVersion=1`.
pub fn create_sqr_secret() -> (KeyPair, String) {
    let pair = KeyPair::generate();
    let encoded = BASE64.encode(pair.public_key());
    let secret: String = url::form_urlencoded::byte_serialize(encoded.as_bytes()).collect();
    (pair, format!("?secret={}&e2eeVersion=1", secret))
}

/// Decrypts a login key chain; returns `(private, public)`.
pub fn decrypt_key_chain(private: &[u8], server_public: &[u8], key_chain: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let secret = crypto::shared_secret(private, server_public)?;
    let plain = crypto::cbc_decrypt(&secret, key_chain)?;
    let fields = protocol::decode_struct(&plain, ProtocolKind::Compact)?;

    let key = match fields.get(1) {
        Some(value) => match value.as_list() {
            Some(items) => items.first().and_then(|v| v.as_struct()),
            None => value.as_struct(),
        },
        None => None,
    }
    .ok_or_else(|| ClientError::MalformedResponse("key chain has no key".into()))?;

    let public = key.bytes(4).map(<[u8]>::to_vec).unwrap_or_default();
    let private = key.bytes(5).map(<[u8]>::to_vec).unwrap_or_default();
    Ok((private, public))
}

/// Metadata attached to an encrypted outgoing message.
pub fn e2ee_metadata(content_type: i32) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("e2eeVersion".to_string(), "2".to_string()),
        ("contentType".to_string(), content_type.to_string()),
        ("e2eeMark".to_string(), "2".to_string()),
    ])
}

/// True if `mid` is a direct (user) chat.
pub fn is_direct_chat(mid: &str) -> bool {
    to_type_of(mid) == MidType::User.as_i32()
}
