//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec, envelope and cryptographic failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Decoding errors
    /// Input ended before the value being read was complete.
    #[error("Unexpected end of data")]
    UnexpectedEof,

    /// The message header carried a protocol id this codec does not speak.
    #[error("protocol mismatch: expected protocol id {expected:#04x}, got {got:#04x}")]
    ProtocolMismatch {
        /// Protocol id this reader expects.
        expected: u8,
        /// Protocol id found in the header.
        got: u8,
    },

    /// The message header carried an unsupported version.
    #[error("bad protocol version: {0:#x}")]
    BadVersion(u32),

    /// A type id on the wire does not name a known type.
    #[error("invalid wire type id: {0}")]
    InvalidType(u8),

    /// A container or string length was negative.
    #[error("negative size: {0}")]
    NegativeSize(i64),

    /// A string that must be text (method names) was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Malformed input that is not a plain truncation.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Encoding errors
    /// A value does not have the shape its declared wire type requires.
    #[error("type mismatch for field {field}: expected {expected}, got {got}")]
    TypeMismatch {
        /// Field id the value was written under (0 for container elements).
        field: i16,
        /// Wire type the envelope declared.
        expected: &'static str,
        /// Shape of the value that was supplied.
        got: &'static str,
    },

    /// An integer does not fit the declared wire width.
    #[error("value {value} out of range for {ttype}")]
    ValueOutOfRange {
        /// The offending value.
        value: i64,
        /// Wire type name.
        ttype: &'static str,
    },

    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption or authentication tag verification failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Padding could not be removed from a decrypted key.
    #[error("invalid padding: last byte {0}")]
    InvalidPadding(u8),

    /// Key material of the wrong length or shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true if this error means the input was cut short.
    pub fn is_truncation(&self) -> bool {
        matches!(self, ProtocolError::UnexpectedEof)
    }
}
