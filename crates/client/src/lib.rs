//! # LineWire Client Library
//!
//! This crate provides the RPC client for LineWire: the HTTP transport, typed
//! service wrappers, end-to-end encryption, and the long-poll listeners that
//! turn the server's operation streams into events.
//!
//! ## Overview
//!
//! - **Transport**: HTTPS POST of Thrift-encoded calls with access token
//!   rotation and a single automatic token refresh
//! - **Services**: typed talk, square, auth and QR login calls returning
//!   normalized models
//! - **E2EE**: key registration, peer and group key exchange, message
//!   encryption and decryption
//! - **Listeners**: talk `sync` and square `fetchMyEvents` long polls with
//!   backoff, supervised by a watchdog
//! - **Storage**: credential store contract with memory and JSON file backends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         LineClient                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │ TalkListener │  │SquareListener│  │     Watchdog      │  │
//! │  └──────┬───────┘  └──────┬───────┘  └───────────────────┘  │
//! │         │   ClientEvent channel (bounded mpsc)              │
//! │  ┌──────┴─────────────────┴──────┐  ┌───────────────────┐  │
//! │  │  TalkService / SquareService  │──│    E2eeEngine     │  │
//! │  └──────────────┬────────────────┘  └─────────┬─────────┘  │
//! │  ┌──────────────┴────────────────┐  ┌─────────┴─────────┐  │
//! │  │   HttpTransport (RpcCaller)   │  │  CredentialStore  │  │
//! │  └───────────────────────────────┘  └───────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::{Config, LineClient, ListenerKind, MemoryStore, OutgoingMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let _guard = client::logging::init_tracing(&config.logging);
//!
//!     let client = LineClient::new(config, Arc::new(MemoryStore::new())).await?;
//!     client.login_with_token("access-token").await?;
//!
//!     let mut events = client.events().expect("first call");
//!     client.start_listening(&[ListenerKind::Talk, ListenerKind::Square]).await?;
//!
//!     client.send_message(OutgoingMessage::text("u0123", "hello").e2ee(true)).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration and validation
//! - [`logging`]: tracing subscriber setup
//! - [`transport`]: RPC caller trait and HTTP transport
//! - [`services`]: talk, square, auth and login calls
//! - [`models`]: typed replies
//! - [`e2ee`]: encryption engine and key records
//! - [`listener`]: long-poll listeners and watchdog
//! - [`storage`]: credential stores
//! - [`client`]: the composition root

pub mod client;
pub mod config;
pub mod device;
pub mod e2ee;
pub mod error;
pub mod listener;
pub mod logging;
pub mod models;
pub mod services;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use client::{LineClient, LineClientBuilder, LoginPrompt};
pub use config::Config;
pub use device::Device;
pub use e2ee::{E2eeEngine, E2eePayload};
pub use error::{ClientError, Result, ServiceError, ServiceErrorKind};
pub use listener::{BackoffPolicy, BackoffState, ClientEvent, ListenerKind};
pub use models::{
    Location, Message, MessageFields, Operation, OutgoingMessage, Profile, SquareEvent, SquareMessage, TalkMessage,
};
pub use session::Session;
pub use storage::{CredentialStore, FileStore, MemoryStore};
pub use transport::{HttpTransport, RpcCaller, RpcRequest};
