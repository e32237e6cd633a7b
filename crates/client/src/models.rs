//! Typed views of RPC responses and events.
//!
//! Every response is normalized here, once, from the decoded field-id map.
//! Downstream code never looks at raw field ids.

use std::collections::BTreeMap;

use protocol::{Envelope, Field, StructValue, TType, Value, WireValue};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Content type of a plain text message.
pub const CONTENT_TYPE_NONE: i32 = 0;

/// Content type of a location message.
pub const CONTENT_TYPE_LOCATION: i32 = 15;

/// Operation types that carry a message.
pub const OP_SEND_MESSAGE: i32 = 25;
pub const OP_RECEIVE_MESSAGE: i32 = 26;

/// Square event type carrying a chat message notification.
pub const SQUARE_NOTIFICATION_MESSAGE: i32 = 29;

/// Entity kind encoded in the first character of a mid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidType {
    User,
    Room,
    Group,
    Square,
    Bot,
    Page,
    Voom,
    Timeline,
}

impl MidType {
    pub fn from_mid(mid: &str) -> Option<Self> {
        match mid.chars().next()? {
            'u' => Some(MidType::User),
            'r' => Some(MidType::Room),
            'c' => Some(MidType::Group),
            's' => Some(MidType::Square),
            'm' => Some(MidType::Bot),
            'p' => Some(MidType::Page),
            'v' => Some(MidType::Voom),
            't' => Some(MidType::Timeline),
            _ => None,
        }
    }

    /// Wire value of the `toType` enum.
    pub fn as_i32(self) -> i32 {
        match self {
            MidType::User => 0,
            MidType::Room => 1,
            MidType::Group => 2,
            MidType::Square => 3,
            MidType::Bot => 4,
            MidType::Page => 5,
            MidType::Voom => 6,
            MidType::Timeline => 7,
        }
    }
}

/// `toType` for a mid, defaulting to user.
pub fn to_type_of(mid: &str) -> i32 {
    MidType::from_mid(mid).map(MidType::as_i32).unwrap_or(0)
}

fn owned_str(fields: &StructValue, id: i16) -> Option<String> {
    fields.str(id).map(str::to_string)
}

fn required_struct<'a>(value: &'a WireValue, what: &str) -> Result<&'a StructValue> {
    value
        .as_struct()
        .ok_or_else(|| ClientError::MalformedResponse(format!("{} is not a struct", what)))
}

/// The logged-in user's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub mid: String,
    pub display_name: String,
    pub picture_status: Option<String>,
    pub status_message: Option<String>,
}

impl Profile {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = required_struct(value, "profile")?;
        let mid = owned_str(fields, 1)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ClientError::MalformedResponse("profile has no mid".into()))?;
        Ok(Self {
            mid,
            display_name: owned_str(fields, 20).unwrap_or_default(),
            picture_status: owned_str(fields, 22),
            status_message: owned_str(fields, 24),
        })
    }
}

/// A published E2EE public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eePublicKey {
    pub version: i32,
    pub key_id: i32,
    pub key_data: Vec<u8>,
    pub created_time: Option<i64>,
}

impl E2eePublicKey {
    pub fn from_struct(fields: &StructValue) -> Result<Self> {
        let key_id = fields
            .i32(2)
            .ok_or_else(|| ClientError::MalformedResponse("public key has no key id".into()))?;
        Ok(Self {
            version: fields.i32(1).unwrap_or(1),
            key_id,
            key_data: fields.bytes(4).map(<[u8]>::to_vec).unwrap_or_default(),
            created_time: fields.i64(5),
        })
    }

    /// Parses a LIST of public key structs, skipping malformed entries.
    pub fn list_from_wire(value: &WireValue) -> Vec<Self> {
        value
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(WireValue::as_struct)
            .filter_map(|s| Self::from_struct(s).ok())
            .collect()
    }

    /// Parses a `mid -> public key` MAP.
    pub fn map_from_wire(value: &WireValue) -> BTreeMap<String, Self> {
        value
            .as_map()
            .unwrap_or_default()
            .iter()
            .filter_map(|(k, v)| {
                let mid = k.as_str()?.to_string();
                let key = Self::from_struct(v.as_struct()?).ok()?;
                Some((mid, key))
            })
            .collect()
    }
}

/// Result of negotiating a peer's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    pub allowed_types: Vec<i32>,
    pub public_key: Option<E2eePublicKey>,
    /// `None` or `-1` means the peer cannot do E2EE.
    pub spec_version: Option<i32>,
}

impl NegotiationResult {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = required_struct(value, "negotiation result")?;
        Ok(Self {
            allowed_types: fields
                .list(1)
                .unwrap_or_default()
                .iter()
                .filter_map(WireValue::as_i32)
                .collect(),
            public_key: fields
                .structure(2)
                .map(E2eePublicKey::from_struct)
                .transpose()?,
            spec_version: fields.i32(3),
        })
    }

    pub fn is_supported(&self) -> bool {
        matches!(self.spec_version, Some(v) if v != -1)
    }
}

/// A group key wrapped for one receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSharedKey {
    pub key_version: i32,
    pub group_key_id: i32,
    pub creator: String,
    pub creator_key_id: i32,
    pub receiver: Option<String>,
    pub receiver_key_id: i32,
    pub encrypted_shared_key: Vec<u8>,
}

impl GroupSharedKey {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = required_struct(value, "group shared key")?;
        let missing = |what: &str| ClientError::MalformedResponse(format!("group shared key has no {}", what));
        Ok(Self {
            key_version: fields.i32(1).unwrap_or(1),
            group_key_id: fields.i32(2).ok_or_else(|| missing("group key id"))?,
            creator: owned_str(fields, 3).ok_or_else(|| missing("creator"))?,
            creator_key_id: fields.i32(4).ok_or_else(|| missing("creator key id"))?,
            receiver: owned_str(fields, 5),
            receiver_key_id: fields.i32(6).ok_or_else(|| missing("receiver key id"))?,
            encrypted_shared_key: fields
                .bytes(7)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| missing("encrypted key"))?,
        })
    }
}

/// A shared location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Location {
    pub fn from_struct(fields: &StructValue) -> Self {
        Self {
            title: owned_str(fields, 1),
            address: owned_str(fields, 2),
            latitude: fields.double(3),
            longitude: fields.double(4),
            phone: owned_str(fields, 5),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new()
            .with_opt(self.title.as_deref().map(|t| Field::string(1, t)))
            .with_opt(self.address.as_deref().map(|a| Field::string(2, a)))
            .with_opt(self.latitude.map(|v| Field::double(3, v)))
            .with_opt(self.longitude.map(|v| Field::double(4, v)))
            .with_opt(self.phone.as_deref().map(|p| Field::string(5, p)))
    }
}

/// Fields shared by talk and square messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageData {
    pub from: String,
    pub to: String,
    pub to_type: i32,
    pub id: String,
    pub created_time: Option<i64>,
    pub text: Option<String>,
    pub location: Option<Location>,
    pub content_type: i32,
    pub content_metadata: BTreeMap<String, String>,
    pub chunks: Vec<Vec<u8>>,
    pub related_message_id: Option<String>,
}

impl MessageData {
    pub fn from_struct(fields: &StructValue) -> Self {
        Self {
            from: owned_str(fields, 1).unwrap_or_default(),
            to: owned_str(fields, 2).unwrap_or_default(),
            to_type: fields.i32(3).unwrap_or(0),
            id: owned_str(fields, 4).unwrap_or_default(),
            created_time: fields.i64(5),
            text: owned_str(fields, 10),
            location: fields.structure(11).map(Location::from_struct),
            content_type: fields.i32(15).unwrap_or(CONTENT_TYPE_NONE),
            content_metadata: fields.string_map(18),
            chunks: fields
                .list(20)
                .unwrap_or_default()
                .iter()
                .filter_map(|c| c.as_bytes().map(<[u8]>::to_vec))
                .collect(),
            related_message_id: owned_str(fields, 21),
        }
    }

    /// True if the sender marked the payload as end-to-end encrypted.
    pub fn is_e2ee(&self) -> bool {
        self.content_metadata
            .get("e2eeVersion")
            .is_some_and(|v| !v.is_empty())
    }
}

/// A message in a direct chat, room or group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TalkMessage {
    pub data: MessageData,
    /// Set when the payload was encrypted and could not be decrypted.
    pub decryption_error: Option<String>,
}

impl TalkMessage {
    pub fn from_struct(fields: &StructValue) -> Self {
        Self {
            data: MessageData::from_struct(fields),
            decryption_error: None,
        }
    }

    pub fn to(&self) -> &str {
        &self.data.to
    }

    pub fn to_type(&self) -> i32 {
        self.data.to_type
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.data.chunks
    }

    pub fn is_e2ee(&self) -> bool {
        self.data.is_e2ee()
    }

    pub fn decryption_failed(&self) -> bool {
        self.decryption_error.is_some()
    }
}

/// A message in a square chat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SquareMessage {
    pub data: MessageData,
    pub sender_display_name: String,
    pub revision: Option<i64>,
}

impl SquareMessage {
    /// Parses a SquareMessage struct (field 1 is the inner message).
    pub fn from_struct(fields: &StructValue, sender_display_name: String) -> Self {
        let data = match fields.structure(1) {
            Some(inner) => MessageData::from_struct(inner),
            None => MessageData::from_struct(fields),
        };
        Self {
            data,
            sender_display_name,
            revision: fields.i64(4),
        }
    }

    pub fn square_chat_mid(&self) -> &str {
        &self.data.to
    }

    pub fn sender_display_name(&self) -> &str {
        &self.sender_display_name
    }
}

/// Accessors common to every message kind.
pub trait MessageFields {
    fn data(&self) -> &MessageData;

    fn id(&self) -> &str {
        &self.data().id
    }

    fn text(&self) -> Option<&str> {
        self.data().text.as_deref()
    }

    fn sender_id(&self) -> &str {
        &self.data().from
    }

    fn content_type(&self) -> i32 {
        self.data().content_type
    }

    fn content_metadata(&self) -> &BTreeMap<String, String> {
        &self.data().content_metadata
    }
}

impl MessageFields for TalkMessage {
    fn data(&self) -> &MessageData {
        &self.data
    }
}

impl MessageFields for SquareMessage {
    fn data(&self) -> &MessageData {
        &self.data
    }
}

/// A message from either listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Talk(TalkMessage),
    Square(SquareMessage),
}

impl MessageFields for Message {
    fn data(&self) -> &MessageData {
        match self {
            Message::Talk(m) => &m.data,
            Message::Square(m) => &m.data,
        }
    }
}

/// One entry of the talk operation stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub revision: i64,
    pub created_time: Option<i64>,
    pub op_type: i32,
    pub param1: Option<String>,
    pub param2: Option<String>,
    pub param3: Option<String>,
    pub message: Option<TalkMessage>,
}

impl Operation {
    pub fn from_struct(fields: &StructValue) -> Self {
        Self {
            revision: fields.i64(1).unwrap_or(0),
            created_time: fields.i64(2),
            op_type: fields.i32(3).unwrap_or(0),
            param1: owned_str(fields, 10),
            param2: owned_str(fields, 11),
            param3: owned_str(fields, 12),
            message: fields.structure(20).map(TalkMessage::from_struct),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.op_type, OP_SEND_MESSAGE | OP_RECEIVE_MESSAGE)
    }
}

/// Reply of the talk `sync` long poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResponse {
    pub operations: Vec<Operation>,
    pub global_last_revision: Option<i64>,
    pub individual_last_revision: Option<i64>,
    pub full_sync_next_revision: Option<i64>,
}

impl SyncResponse {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = required_struct(value, "sync response")?;
        let mut response = SyncResponse::default();

        if let Some(ops) = fields.structure(1) {
            response.operations = ops
                .list(1)
                .unwrap_or_default()
                .iter()
                .filter_map(WireValue::as_struct)
                .map(Operation::from_struct)
                .collect();
            response.global_last_revision = ops.structure(3).and_then(|e| e.i64(2));
            response.individual_last_revision = ops.structure(4).and_then(|e| e.i64(2));
        }
        if let Some(full_sync) = fields.structure(2) {
            response.full_sync_next_revision = full_sync.i64(2);
        }
        Ok(response)
    }
}

/// One square event.
#[derive(Debug, Clone, PartialEq)]
pub struct SquareEvent {
    pub created_time: Option<i64>,
    pub event_type: i32,
    pub payload: StructValue,
}

impl SquareEvent {
    pub fn from_struct(fields: &StructValue) -> Self {
        Self {
            created_time: fields.i64(1),
            event_type: fields.i32(3).unwrap_or(-1),
            payload: fields.structure(4).cloned().unwrap_or_default(),
        }
    }

    /// The chat message carried by a notification event.
    ///
    /// Servers put the message at notification field 2 or 3 and the sender
    /// name at 3 or 4; both layouts are accepted.
    pub fn notification_message(&self) -> Option<SquareMessage> {
        if self.event_type != SQUARE_NOTIFICATION_MESSAGE {
            return None;
        }
        let notification = self.payload.structure(30)?;
        let (message, name_field) = match notification.structure(2) {
            Some(message) => (message, 3),
            None => (notification.structure(3)?, 4),
        };
        let sender_display_name = notification
            .str(name_field)
            .filter(|n| !n.is_empty())
            .or_else(|| notification.str(4))
            .unwrap_or_default()
            .to_string();
        Some(SquareMessage::from_struct(message, sender_display_name))
    }
}

/// Reply of the square `fetchMyEvents` long poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchMyEventsResponse {
    pub subscription_id: Option<i64>,
    pub events: Vec<SquareEvent>,
    pub sync_token: Option<String>,
    pub continuation_token: Option<String>,
}

impl FetchMyEventsResponse {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = required_struct(value, "fetchMyEvents response")?;
        Ok(Self {
            subscription_id: fields.structure(1).and_then(|s| s.i64(1)),
            events: fields
                .list(2)
                .unwrap_or_default()
                .iter()
                .filter_map(WireValue::as_struct)
                .map(SquareEvent::from_struct)
                .collect(),
            sync_token: owned_str(fields, 3).filter(|t| !t.is_empty()),
            continuation_token: owned_str(fields, 4).filter(|t| !t.is_empty()),
        })
    }
}

/// A message to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub text: Option<String>,
    pub location: Option<Location>,
    pub content_type: i32,
    pub content_metadata: BTreeMap<String, String>,
    pub related_message_id: Option<String>,
    /// Encrypt the payload end to end.
    pub e2ee: bool,
}

impl OutgoingMessage {
    pub fn text(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn location(to: impl Into<String>, location: Location) -> Self {
        Self {
            to: to.into(),
            location: Some(location),
            content_type: CONTENT_TYPE_LOCATION,
            ..Self::default()
        }
    }

    pub fn e2ee(mut self, e2ee: bool) -> Self {
        self.e2ee = e2ee;
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.related_message_id = Some(message_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.content_metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the Message struct.
    ///
    /// `chunks` replaces the plaintext when present. `related_service` is the
    /// service code of the replied-to message (1 talk, 2 square).
    pub fn to_envelope(&self, chunks: Option<&[Vec<u8>]>, related_service: i32, include_to_type: bool) -> Envelope {
        let encrypted = chunks.is_some();
        let metadata = (!self.content_metadata.is_empty()).then(|| {
            self.content_metadata
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
                .collect()
        });

        let mut envelope = Envelope::new().with(Field::string(2, self.to.as_str()));
        if include_to_type {
            envelope.push(Field::i32(3, to_type_of(&self.to)));
        }
        envelope
            .with(Field::i32(15, self.content_type))
            .with_opt(
                self.text
                    .as_deref()
                    .filter(|t| !encrypted && !t.is_empty())
                    .map(|t| Field::string(10, t)),
            )
            .with_opt(
                self.location
                    .as_ref()
                    .filter(|_| !encrypted)
                    .map(|l| Field::structure(11, l.to_envelope())),
            )
            .with_opt(metadata.map(|m| Field::map(18, TType::String, TType::String, Some(m))))
            .with_opt(chunks.map(|c| {
                Field::list(
                    20,
                    TType::String,
                    Some(c.iter().map(|b| Value::Bytes(b.clone())).collect()),
                )
            }))
            .with_opt(
                self.related_message_id
                    .as_deref()
                    .map(|id| Field::string(21, id)),
            )
            .with_opt(self.related_message_id.as_ref().map(|_| Field::i32(22, 3)))
            .with_opt(
                self.related_message_id
                    .as_ref()
                    .map(|_| Field::i32(24, related_service)),
            )
    }
}
