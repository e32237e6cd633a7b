//! Talk listener: follows the `sync` operation stream.

use std::sync::Arc;

use super::{BackoffState, ClientEvent, ListenerContext};
use crate::e2ee::E2eeEngine;
use crate::models::{Message, Operation, SyncResponse};
use crate::services::talk::SyncCursor;
use crate::services::TalkService;

pub struct TalkListener {
    talk: Arc<TalkService>,
    e2ee: Arc<E2eeEngine>,
    ctx: ListenerContext,
    limit: i32,
    cursor: SyncCursor,
    backoff: BackoffState,
}

impl TalkListener {
    pub(crate) fn new(talk: Arc<TalkService>, e2ee: Arc<E2eeEngine>, ctx: ListenerContext, limit: i32) -> Self {
        Self {
            talk,
            e2ee,
            ctx,
            limit,
            cursor: SyncCursor::default(),
            backoff: BackoffState::default(),
        }
    }

    pub fn cursor(&self) -> SyncCursor {
        self.cursor
    }

    /// Polls until cancelled, logged out, or out of retries.
    pub async fn run(mut self) {
        tracing::debug!("Talk listener started");
        while self.ctx.should_run() {
            let result = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                result = self.talk.sync(self.cursor, self.limit) => result,
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
        tracing::debug!("Talk listener stopped at revision {}", self.cursor.revision);
    }

    /// Emits one batch, then advances the cursor.
    async fn dispatch(&mut self, response: SyncResponse) -> bool {
        let mut max_revision = self.cursor.revision;
        for mut op in response.operations.iter().cloned() {
            max_revision = max_revision.max(op.revision);
            if !self.emit_operation(&mut op).await {
                return false;
            }
        }

        advance_cursor(&mut self.cursor, &response);
        self.cursor.revision = self.cursor.revision.max(max_revision);
        true
    }

    async fn emit_operation(&self, op: &mut Operation) -> bool {
        if op.is_message() {
            if let Some(message) = op.message.as_mut() {
                if message.is_e2ee() {
                    if let Err(e) = self.e2ee.decrypt_message(message).await {
                        tracing::warn!("Failed to decrypt message {}: {}", message.data.id, e);
                        message.decryption_error = Some(e.to_string());
                    }
                }
            }
        }

        if !self.ctx.emit(ClientEvent::TalkEvent(op.clone())).await {
            return false;
        }
        match op.message.take() {
            Some(message) if op.is_message() => self.ctx.emit(ClientEvent::Message(Message::Talk(message))).await,
            _ => true,
        }
    }
}

/// Applies the revisions reported by the server. Only values actually
/// present overwrite the cursor.
pub(crate) fn advance_cursor(cursor: &mut SyncCursor, response: &SyncResponse) {
    if let Some(next) = response.full_sync_next_revision.filter(|r| *r != 0) {
        cursor.revision = next;
    }
    if let Some(global) = response.global_last_revision.filter(|r| *r > 0) {
        cursor.global_revision = global;
    }
    if let Some(individual) = response.individual_last_revision.filter(|r| *r > 0) {
        cursor.individual_revision = individual;
    }
}
