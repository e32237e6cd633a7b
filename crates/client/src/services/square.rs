//! Square (open chat) service.

use std::sync::Arc;
use std::time::Duration;

use protocol::{Envelope, Field};

use crate::error::Result;
use crate::models::{FetchMyEventsResponse, OutgoingMessage, SquareMessage};
use crate::services::talk::seq_i32;
use crate::session::Session;
use crate::transport::{RpcCaller, RpcRequest};

pub const SQUARE_PATH: &str = "/SQ1";

const REQSEQ_NAME: &str = "sq";

/// Related-message service code for square replies.
const RELATED_SERVICE_SQUARE: i32 = 2;

/// Square message revision sent with new messages.
const SQUARE_MESSAGE_REVISION: i64 = 4;

/// Cursor sent with a `fetchMyEvents` long poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchCursor {
    pub subscription_id: Option<i64>,
    pub sync_token: Option<String>,
    pub continuation_token: Option<String>,
}

pub struct SquareService {
    caller: Arc<dyn RpcCaller>,
    session: Arc<Session>,
    long_timeout: Duration,
}

impl SquareService {
    pub fn new(caller: Arc<dyn RpcCaller>, session: Arc<Session>, long_timeout: Duration) -> Self {
        Self {
            caller,
            session,
            long_timeout,
        }
    }

    /// Long-polls for square events after `cursor`.
    pub async fn fetch_my_events(&self, cursor: &FetchCursor, limit: i32) -> Result<FetchMyEventsResponse> {
        let request = Envelope::new()
            .with(Field::i32(3, limit))
            .with_opt(cursor.subscription_id.map(|id| Field::i64(1, id)))
            .with_opt(
                cursor
                    .sync_token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .map(|t| Field::string(2, t)),
            )
            .with_opt(
                cursor
                    .continuation_token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .map(|t| Field::string(4, t)),
            );
        let rpc = RpcRequest::new(
            "fetchMyEvents",
            SQUARE_PATH,
            Envelope::new().with(Field::structure(1, request)),
        )
        .timeout(self.long_timeout);
        let value = self.caller.call(rpc).await?;
        FetchMyEventsResponse::from_wire(&value)
    }

    /// Sends a message to a square chat. `message.to` is the square chat mid.
    pub async fn send_message(&self, message: &OutgoingMessage) -> Result<SquareMessage> {
        let seq = self.session.next_reqseq(REQSEQ_NAME).await?;
        let square_message = Envelope::new()
            .with(Field::structure(
                1,
                message.to_envelope(None, RELATED_SERVICE_SQUARE, false),
            ))
            .with(Field::i64(4, SQUARE_MESSAGE_REVISION));
        let request = Envelope::new()
            .with(Field::i32(1, seq_i32(seq)?))
            .with(Field::string(2, message.to.as_str()))
            .with(Field::structure(3, square_message));
        let value = self
            .caller
            .call(RpcRequest::new(
                "sendMessage",
                SQUARE_PATH,
                Envelope::new().with(Field::structure(1, request)),
            ))
            .await?;
        Ok(value
            .as_struct()
            .and_then(|s| s.structure(1))
            .map(|m| SquareMessage::from_struct(m, String::new()))
            .unwrap_or_default())
    }
}
