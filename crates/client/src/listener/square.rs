//! Square listener: follows `fetchMyEvents`.

use std::sync::Arc;

use super::{BackoffState, ClientEvent, ListenerContext};
use crate::models::{FetchMyEventsResponse, Message};
use crate::services::square::FetchCursor;
use crate::services::SquareService;

pub struct SquareListener {
    square: Arc<SquareService>,
    ctx: ListenerContext,
    limit: i32,
    cursor: FetchCursor,
    backoff: BackoffState,
}

impl SquareListener {
    pub(crate) fn new(square: Arc<SquareService>, ctx: ListenerContext, limit: i32) -> Self {
        Self {
            square,
            ctx,
            limit,
            cursor: FetchCursor::default(),
            backoff: BackoffState::default(),
        }
    }

    pub fn cursor(&self) -> &FetchCursor {
        &self.cursor
    }

    /// Polls until cancelled, logged out, or out of retries. While the server
    /// hands out a continuation token the next page is fetched immediately.
    pub async fn run(mut self) {
        tracing::debug!("Square listener started");
        while self.ctx.should_run() {
            let result = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                result = self.square.fetch_my_events(&self.cursor, self.limit) => result,
            };

            let keep_going = match result {
                Ok(response) => {
                    self.backoff.reset();
                    self.dispatch(response).await
                }
                Err(err) => self.ctx.handle_failure(&mut self.backoff, err).await,
            };
            if !keep_going {
                break;
            }
        }
        tracing::debug!("Square listener stopped");
    }

    async fn dispatch(&mut self, response: FetchMyEventsResponse) -> bool {
        for event in &response.events {
            let message = event.notification_message();
            if !self.ctx.emit(ClientEvent::SquareEvent(event.clone())).await {
                return false;
            }
            if let Some(message) = message {
                if !self.ctx.emit(ClientEvent::Message(Message::Square(message))).await {
                    return false;
                }
            }
        }

        advance_cursor(&mut self.cursor, response);
        true
    }
}

pub(crate) fn advance_cursor(cursor: &mut FetchCursor, response: FetchMyEventsResponse) {
    if response.subscription_id.is_some() {
        cursor.subscription_id = response.subscription_id;
    }
    cursor.continuation_token = response.continuation_token;
    if response.sync_token.is_some() {
        cursor.sync_token = response.sync_token;
    }
}
