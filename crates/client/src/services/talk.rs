//! Talk service: profile, E2EE key exchange, messaging and sync.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Envelope, Field, TType, Value, WireValue};

use crate::error::{ClientError, Result};
use crate::models::{
    E2eePublicKey, GroupSharedKey, NegotiationResult, OutgoingMessage, Profile, SyncResponse, TalkMessage,
};
use crate::session::Session;
use crate::transport::{RpcCaller, RpcRequest};

pub const TALK_PATH: &str = "/S4";
pub const SYNC_PATH: &str = "/SYNC4";

/// Request sequence counter name for talk calls.
const REQSEQ_NAME: &str = "talk";

/// Related-message service code for talk replies.
const RELATED_SERVICE_TALK: i32 = 1;

/// Cursor sent with a `sync` long poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub revision: i64,
    pub global_revision: i64,
    pub individual_revision: i64,
}

pub struct TalkService {
    caller: Arc<dyn RpcCaller>,
    session: Arc<Session>,
    long_timeout: Duration,
}

impl TalkService {
    pub fn new(caller: Arc<dyn RpcCaller>, session: Arc<Session>, long_timeout: Duration) -> Self {
        Self {
            caller,
            session,
            long_timeout,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn call(&self, method: &str, envelope: Envelope) -> Result<WireValue> {
        self.caller.call(RpcRequest::new(method, TALK_PATH, envelope)).await
    }

    /// Returns the current value of the talk request sequence counter.
    pub async fn next_reqseq(&self) -> Result<i64> {
        self.session.next_reqseq(REQSEQ_NAME).await
    }

    pub async fn get_profile(&self) -> Result<Profile> {
        let value = self.call("getProfile", Envelope::new()).await?;
        Profile::from_wire(&value)
    }

    /// Public keys registered for the logged-in account.
    pub async fn get_e2ee_public_keys(&self) -> Result<Vec<E2eePublicKey>> {
        let value = self.call("getE2EEPublicKeys", Envelope::new()).await?;
        Ok(E2eePublicKey::list_from_wire(&value))
    }

    /// Registers a public key; returns the key as stored by the server.
    pub async fn register_e2ee_public_key(
        &self,
        req_seq: i64,
        key: &E2eePublicKey,
    ) -> Result<Option<E2eePublicKey>> {
        let public_key = Envelope::new()
            .with(Field::i32(1, key.version))
            .with(Field::i32(2, key.key_id))
            .with(Field::binary(4, key.key_data.clone()))
            .with(Field::i64(5, key.created_time.unwrap_or(0)));
        let envelope = Envelope::new()
            .with(Field::i32(1, seq_i32(req_seq)?))
            .with(Field::structure(2, public_key));
        let value = self.call("registerE2EEPublicKey", envelope).await?;
        Ok(value.as_struct().and_then(|s| E2eePublicKey::from_struct(s).ok()))
    }

    pub async fn negotiate_e2ee_public_key(&self, mid: &str) -> Result<NegotiationResult> {
        let value = self
            .call("negotiateE2EEPublicKey", Envelope::new().with(Field::string(2, mid)))
            .await?;
        NegotiationResult::from_wire(&value)
    }

    pub async fn get_last_e2ee_group_shared_key(&self, key_version: i32, chat_mid: &str) -> Result<GroupSharedKey> {
        let envelope = Envelope::new()
            .with(Field::i32(2, key_version))
            .with(Field::string(3, chat_mid));
        let value = self.call("getLastE2EEGroupSharedKey", envelope).await?;
        GroupSharedKey::from_wire(&value)
    }

    pub async fn get_e2ee_group_shared_key(
        &self,
        key_version: i32,
        chat_mid: &str,
        group_key_id: i32,
    ) -> Result<GroupSharedKey> {
        let envelope = Envelope::new()
            .with(Field::i32(2, key_version))
            .with(Field::string(3, chat_mid))
            .with(Field::i32(4, group_key_id));
        let value = self.call("getE2EEGroupSharedKey", envelope).await?;
        GroupSharedKey::from_wire(&value)
    }

    /// Current public key of every member of a chat, by mid.
    pub async fn get_last_e2ee_public_keys(&self, chat_mid: &str) -> Result<BTreeMap<String, E2eePublicKey>> {
        let value = self
            .call("getLastE2EEPublicKeys", Envelope::new().with(Field::string(2, chat_mid)))
            .await?;
        Ok(E2eePublicKey::map_from_wire(&value))
    }

    /// Registers a group key wrapped for each member; returns the group key id.
    pub async fn register_e2ee_group_key(
        &self,
        key_version: i32,
        chat_mid: &str,
        members: Vec<String>,
        key_ids: Vec<i32>,
        encrypted_keys: Vec<Vec<u8>>,
    ) -> Result<Option<i32>> {
        let envelope = Envelope::new()
            .with(Field::i32(2, key_version))
            .with(Field::string(3, chat_mid))
            .with(Field::list(4, TType::String, Some(members.into_iter().map(Value::from).collect())))
            .with(Field::list(5, TType::I32, Some(key_ids.into_iter().map(Value::from).collect())))
            .with(Field::list(
                6,
                TType::String,
                Some(encrypted_keys.into_iter().map(Value::Bytes).collect()),
            ));
        let value = self.call("registerE2EEGroupKey", envelope).await?;
        Ok(value.as_struct().and_then(|s| s.i32(2)))
    }

    /// Long-polls for operations after `cursor`.
    pub async fn sync(&self, cursor: SyncCursor, limit: i32) -> Result<SyncResponse> {
        let request = Envelope::new()
            .with(Field::i64(1, cursor.revision))
            .with(Field::i32(2, limit))
            .with(Field::i64(3, cursor.global_revision))
            .with(Field::i64(4, cursor.individual_revision));
        let rpc = RpcRequest::new("sync", SYNC_PATH, Envelope::new().with(Field::structure(1, request)))
            .timeout(self.long_timeout);
        let value = self.caller.call(rpc).await?;
        SyncResponse::from_wire(&value)
    }

    /// Sends a message as given. Encryption and retries are the caller's job.
    ///
    /// When `chunks` is set the plaintext is left out of the request.
    pub async fn send_message(&self, message: &OutgoingMessage, chunks: Option<&[Vec<u8>]>) -> Result<TalkMessage> {
        let seq = self.next_reqseq().await?;
        let envelope = Envelope::new()
            .with(Field::i32(1, seq_i32(seq)?))
            .with(Field::structure(
                2,
                message.to_envelope(chunks, RELATED_SERVICE_TALK, true),
            ));
        let value = self.call("sendMessage", envelope).await?;
        Ok(value.as_struct().map(TalkMessage::from_struct).unwrap_or_default())
    }
}

pub(crate) fn seq_i32(seq: i64) -> Result<i32> {
    i32::try_from(seq).map_err(|_| ClientError::MalformedResponse(format!("request sequence {} overflows i32", seq)))
}
