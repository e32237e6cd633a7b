//! # LineWire Protocol Library
//!
//! This crate provides the wire codec and cryptographic primitives for the
//! LineWire messaging client.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of LineWire's RPC layer, providing:
//!
//! - **Wire Codec**: Thrift-family Binary and Compact encodings with a shared
//!   reader/writer interface and a generic `skip`
//! - **Value Model**: dynamic decoded values that keep text and raw binary apart
//! - **Envelope Builder**: ordered `(type, id, value)` triples encoded as call
//!   arguments, and replies parsed back into field maps
//! - **E2EE Primitives**: X25519 agreement, AES-CBC key wrap, AES-GCM message
//!   seal with bound associated data
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Envelope / ParsedMessage         │  (type, id, value) triples
//! ├─────────────────────────────────────────┤
//! │      WireValue / StructValue model      │  text vs. binary preserved
//! ├─────────────────────────────────────────┤
//! │     Binary (3)   │   Compact (4)        │  ProtocolRead / ProtocolWrite
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode, encode, Envelope, Field, ProtocolKind};
//!
//! let envelope = Envelope::new()
//!     .with(Field::i32(1, 42))
//!     .with(Field::string(2, "hello"));
//!
//! let bytes = encode(&envelope, "testMethod", ProtocolKind::Compact).unwrap();
//! let message = decode(&bytes, ProtocolKind::Compact).unwrap();
//!
//! assert_eq!(message.method, "testMethod");
//! assert_eq!(message.fields.i32(1), Some(42));
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: Binary and Compact codecs, type ids, value model
//! - [`envelope`]: Envelope DSL, `encode` / `decode`
//! - [`crypto`]: E2EE key agreement and message encryption
//! - [`error`]: Error types

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod wire;

pub use crypto::{AadContext, KeyPair, MessageChunks};
pub use envelope::{decode, decode_struct, encode, encode_struct, Envelope, Field, ParsedMessage, Value};
pub use error::{ProtocolError, Result};
pub use wire::{MessageKind, ProtocolKind, StructValue, TType, WireValue};
