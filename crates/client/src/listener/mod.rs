//! Long-poll listeners and their supervisor.
//!
//! Two listeners run as independent tasks: the talk listener drives the
//! `sync` operation stream and the square listener drives `fetchMyEvents`.
//! Both push [`ClientEvent`]s into one bounded channel and share the same
//! failure policy:
//!
//! - transient failures (timeouts, connection trouble) sleep
//!   `min(base * 2^(n-1), max)` and keep going,
//! - any other failure sleeps a fixed delay, until the consecutive error
//!   count reaches the ceiling and the listener stops,
//! - a successful poll resets the counter.
//!
//! A stopped listener is picked up by the [`watchdog`], which restarts it
//! with fresh state a bounded number of times.

pub mod square;
pub mod talk;
pub mod watchdog;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::e2ee::E2eeEngine;
use crate::error::ClientError;
use crate::models::{Message, Operation, SquareEvent};
use crate::services::{SquareService, TalkService};
use crate::session::Session;

pub use square::SquareListener;
pub use talk::TalkListener;
pub use watchdog::{ListenerFactory, Supervisor};

/// Which long-poll stream a listener follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKind {
    Talk,
    Square,
}

impl ListenerKind {
    pub const ALL: [ListenerKind; 2] = [ListenerKind::Talk, ListenerKind::Square];
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenerKind::Talk => "talk",
            ListenerKind::Square => "square",
        })
    }
}

/// Events delivered to the consumer of the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A chat message from either stream. Encrypted talk messages are
    /// already decrypted, or carry a decryption error.
    Message(Message),
    /// A raw talk operation.
    TalkEvent(Operation),
    /// A raw square event.
    SquareEvent(SquareEvent),
    /// A failed poll.
    Error { kind: ListenerKind, message: String },
}

/// Failure handling parameters shared by both listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub api_error_delay: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            api_error_delay: Duration::from_millis(config.api_error_delay_ms),
            max_consecutive_errors: config.max_consecutive_errors,
        }
    }

    /// Delay after the `n`th consecutive transient failure (1-based).
    pub fn transient_delay(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// What a listener does after a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry(Duration),
    Stop,
}

/// Consecutive failure counter of one listener run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub consecutive_errors: u32,
}

impl BackoffState {
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Counts a failure and decides how to continue.
    pub fn on_failure(&mut self, policy: &BackoffPolicy, err: &ClientError) -> FailureAction {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if err.is_transient() {
            FailureAction::Retry(policy.transient_delay(self.consecutive_errors))
        } else if self.consecutive_errors >= policy.max_consecutive_errors {
            FailureAction::Stop
        } else {
            FailureAction::Retry(policy.api_error_delay)
        }
    }
}

/// Plumbing shared by a listener run: the event sink, the session and the
/// cancellation token.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub(crate) kind: ListenerKind,
    pub(crate) session: Arc<Session>,
    pub(crate) events: mpsc::Sender<ClientEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) policy: BackoffPolicy,
}

impl ListenerContext {
    /// True while the listener should keep polling.
    pub(crate) fn should_run(&self) -> bool {
        !self.cancel.is_cancelled() && self.session.is_logged_in()
    }

    /// Delivers an event. Returns false if the listener should stop.
    pub(crate) async fn emit(&self, event: ClientEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// Sleeps unless cancelled first. Returns false if cancelled.
    pub(crate) async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Applies the failure policy. Returns false if the listener should stop.
    pub(crate) async fn handle_failure(&self, backoff: &mut BackoffState, err: ClientError) -> bool {
        if matches!(err, ClientError::Cancelled) {
            return false;
        }

        let _ = self.events.try_send(ClientEvent::Error {
            kind: self.kind,
            message: err.to_string(),
        });

        match backoff.on_failure(&self.policy, &err) {
            FailureAction::Retry(delay) => {
                tracing::warn!(
                    "{} listener poll failed ({} in a row), retrying in {:?}: {}",
                    self.kind,
                    backoff.consecutive_errors,
                    delay,
                    err
                );
                self.sleep(delay).await
            }
            FailureAction::Stop => {
                tracing::error!(
                    "{} listener stopping after {} consecutive errors: {}",
                    self.kind,
                    backoff.consecutive_errors,
                    err
                );
                false
            }
        }
    }
}

/// Spawns fresh listener tasks on behalf of the watchdog.
pub struct ListenerTasks {
    pub talk: Arc<TalkService>,
    pub square: Arc<SquareService>,
    pub e2ee: Arc<E2eeEngine>,
    pub session: Arc<Session>,
    pub events: mpsc::Sender<ClientEvent>,
    pub policy: BackoffPolicy,
    pub sync_limit: i32,
    pub fetch_limit: i32,
}

impl ListenerTasks {
    fn context(&self, kind: ListenerKind, cancel: CancellationToken) -> ListenerContext {
        ListenerContext {
            kind,
            session: Arc::clone(&self.session),
            events: self.events.clone(),
            cancel,
            policy: self.policy,
        }
    }
}

impl ListenerFactory for ListenerTasks {
    fn spawn(&self, kind: ListenerKind, cancel: CancellationToken) -> JoinHandle<()> {
        let ctx = self.context(kind, cancel);
        match kind {
            ListenerKind::Talk => {
                let listener = TalkListener::new(Arc::clone(&self.talk), Arc::clone(&self.e2ee), ctx, self.sync_limit);
                tokio::spawn(listener.run())
            }
            ListenerKind::Square => {
                let listener = SquareListener::new(Arc::clone(&self.square), ctx, self.fetch_limit);
                tokio::spawn(listener.run())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{ServiceError, ServiceErrorKind};
    use crate::storage::MemoryStore;

    pub(crate) fn context(kind: ListenerKind, capacity: usize) -> (ListenerContext, mpsc::Receiver<ClientEvent>) {
        let session = Arc::new(Session::new(Arc::new(MemoryStore::new())));
        session.set_auth_token(Some("token".into()));
        let (events, rx) = mpsc::channel(capacity);
        let ctx = ListenerContext {
            kind,
            session,
            events,
            cancel: CancellationToken::new(),
            policy: BackoffPolicy::default(),
        };
        (ctx, rx)
    }

    fn api_error() -> ClientError {
        ClientError::Service(ServiceError::from_struct(
            ServiceErrorKind::Talk,
            [(1, protocol::WireValue::I32(10))].into_iter().collect(),
        ))
    }

    #[test]
    fn test_transient_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=9).map(|n| policy.transient_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(policy.transient_delay(40), Duration::from_secs(60));
        assert_eq!(policy.transient_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_delays_never_decrease() {
        let policy = BackoffPolicy::default();
        let mut state = BackoffState::default();
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let FailureAction::Retry(delay) =
                state.on_failure(&policy, &ClientError::TransportTimeout("slow".into()))
            else {
                panic!("transient failures never stop the listener");
            };
            assert!(delay >= last);
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn test_api_errors_hit_the_ceiling() {
        let policy = BackoffPolicy::default();
        let mut state = BackoffState::default();
        for _ in 0..9 {
            assert_eq!(
                state.on_failure(&policy, &api_error()),
                FailureAction::Retry(Duration::from_secs(2))
            );
        }
        assert_eq!(state.on_failure(&policy, &api_error()), FailureAction::Stop);
        assert_eq!(state.consecutive_errors, 10);

        state.reset();
        assert_eq!(
            state.on_failure(&policy, &api_error()),
            FailureAction::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = ListenerConfig {
            base_backoff_ms: 250,
            max_backoff_ms: 1_000,
            api_error_delay_ms: 10,
            max_consecutive_errors: 3,
            ..ListenerConfig::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.transient_delay(1), Duration::from_millis(250));
        assert_eq!(policy.transient_delay(3), Duration::from_millis(1_000));
        assert_eq!(policy.max_consecutive_errors, 3);
    }

    #[tokio::test]
    async fn test_cancelled_error_stops_without_event() {
        let (ctx, mut rx) = context(ListenerKind::Talk, 4);
        let mut state = BackoffState::default();
        assert!(!ctx.handle_failure(&mut state, ClientError::Cancelled).await);
        assert_eq!(state.consecutive_errors, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reports_error_event() {
        let (ctx, mut rx) = context(ListenerKind::Square, 4);
        let mut state = BackoffState::default();
        assert!(ctx.handle_failure(&mut state, api_error()).await);
        match rx.try_recv().unwrap() {
            ClientEvent::Error { kind, message } => {
                assert_eq!(kind, ListenerKind::Square);
                assert!(message.contains("service error 10"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sleep_is_cut_short_by_cancel() {
        let (ctx, _rx) = context(ListenerKind::Talk, 1);
        ctx.cancel.cancel();
        assert!(!ctx.sleep(Duration::from_secs(3600)).await);
        assert!(!ctx.should_run());
    }
}
