//! Typed RPC service wrappers.
//!
//! Each wrapper owns a handle to the RPC caller and builds the request
//! envelopes for one sub-service. Replies are normalized into the types in
//! [`crate::models`].

pub mod auth;
pub mod login;
pub mod square;
pub mod talk;

pub use auth::AuthService;
pub use login::LoginService;
pub use square::SquareService;
pub use talk::TalkService;
