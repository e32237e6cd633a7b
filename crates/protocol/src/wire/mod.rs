//! Thrift-family wire encodings.
//!
//! Two interchangeable encodings are supported, selected per call by a
//! [`ProtocolKind`]:
//!
//! - [`binary`]: fixed-width big-endian integers, 1-byte type + 2-byte id
//!   field headers, i32 length-prefixed strings.
//! - [`compact`]: zigzag + LEB128 varints, field-id deltas folded into the
//!   type byte, booleans folded into struct field headers.
//!
//! Both implement [`ProtocolWrite`] / [`ProtocolRead`], so the value layer in
//! [`value`] and the envelope builder work against either one.

pub mod binary;
pub mod compact;
pub mod value;

use std::fmt;

use crate::error::{ProtocolError, Result};

pub use binary::{BinaryReader, BinaryWriter};
pub use compact::{CompactReader, CompactWriter};
pub use value::{StructValue, WireValue};

/// Thrift type ids as they appear in Binary field headers and in the
/// value model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TType {
    /// Returns the wire id of this type.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Returns the upper-case name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            TType::Stop => "STOP",
            TType::Bool => "BOOL",
            TType::Byte => "BYTE",
            TType::Double => "DOUBLE",
            TType::I16 => "I16",
            TType::I32 => "I32",
            TType::I64 => "I64",
            TType::String => "STRING",
            TType::Struct => "STRUCT",
            TType::Map => "MAP",
            TType::Set => "SET",
            TType::List => "LIST",
        }
    }
}

impl TryFrom<u8> for TType {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            0 => TType::Stop,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => return Err(ProtocolError::InvalidType(other)),
        })
    }
}

impl fmt::Display for TType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Selects the on-wire encoding of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Fixed-width Binary protocol (protocol key 3).
    Binary,
    /// Variable-length Compact protocol (protocol key 4).
    Compact,
}

impl ProtocolKind {
    /// Returns the numeric protocol key used by service paths.
    pub fn key(self) -> u8 {
        match self {
            ProtocolKind::Binary => 3,
            ProtocolKind::Compact => 4,
        }
    }
}

impl TryFrom<u8> for ProtocolKind {
    type Error = ProtocolError;

    fn try_from(key: u8) -> Result<Self> {
        match key {
            3 => Ok(ProtocolKind::Binary),
            4 => Ok(ProtocolKind::Compact),
            other => Err(ProtocolError::ProtocolMismatch {
                expected: 4,
                got: other,
            }),
        }
    }
}

/// Kind of an RPC message, carried in the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call,
    Reply,
    Exception,
    Oneway,
    /// Any value outside the four defined kinds, kept as received.
    Other(u8),
}

impl MessageKind {
    /// Returns the numeric kind as written on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Call => 1,
            MessageKind::Reply => 2,
            MessageKind::Exception => 3,
            MessageKind::Oneway => 4,
            MessageKind::Other(raw) => raw,
        }
    }
}

impl From<u8> for MessageKind {
    fn from(raw: u8) -> Self {
        match raw {
            1 => MessageKind::Call,
            2 => MessageKind::Reply,
            3 => MessageKind::Exception,
            4 => MessageKind::Oneway,
            other => MessageKind::Other(other),
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageKind,
    pub seqid: i32,
}

/// Read position over a borrowed byte slice.
///
/// Every read either consumes exactly the bytes it needs or fails with
/// [`ProtocolError::UnexpectedEof`]; nothing is consumed on failure.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current offset from the start of the input.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Consumes `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consumes exactly `N` bytes into an array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Consumes one byte.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Fails with `UnexpectedEof` if fewer than `n` bytes remain.
    ///
    /// Used before trusting a length read from the wire: every element of a
    /// container occupies at least one byte.
    pub fn ensure(&self, n: usize) -> Result<()> {
        if n > self.remaining() {
            Err(ProtocolError::UnexpectedEof)
        } else {
            Ok(())
        }
    }
}

/// Encoder side of a wire protocol.
pub trait ProtocolWrite {
    fn write_message_begin(&mut self, name: &str, kind: MessageKind, seqid: i32) -> Result<()>;
    fn write_struct_begin(&mut self);
    fn write_struct_end(&mut self);
    fn write_field_begin(&mut self, ttype: TType, id: i16);
    fn write_field_stop(&mut self);
    fn write_bool(&mut self, value: bool);
    fn write_byte(&mut self, value: i8);
    fn write_i16(&mut self, value: i16);
    fn write_i32(&mut self, value: i32);
    fn write_i64(&mut self, value: i64);
    fn write_double(&mut self, value: f64);
    fn write_binary(&mut self, value: &[u8]) -> Result<()>;
    fn write_map_begin(&mut self, key: TType, value: TType, size: usize) -> Result<()>;
    fn write_list_begin(&mut self, elem: TType, size: usize) -> Result<()>;

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes())
    }

    fn write_set_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        self.write_list_begin(elem, size)
    }

    /// Consumes the writer, returning the encoded bytes.
    fn into_bytes(self) -> Vec<u8>;
}

/// Decoder side of a wire protocol.
pub trait ProtocolRead<'a> {
    fn read_message_begin(&mut self) -> Result<MessageHeader>;
    fn read_struct_begin(&mut self);
    fn read_struct_end(&mut self);
    /// Reads a field header; `None` is the STOP marker.
    fn read_field_begin(&mut self) -> Result<Option<(TType, i16)>>;
    fn read_bool(&mut self) -> Result<bool>;
    fn read_byte(&mut self) -> Result<i8>;
    fn read_i16(&mut self) -> Result<i16>;
    fn read_i32(&mut self) -> Result<i32>;
    fn read_i64(&mut self) -> Result<i64>;
    fn read_double(&mut self) -> Result<f64>;
    fn read_binary(&mut self) -> Result<&'a [u8]>;
    fn read_map_begin(&mut self) -> Result<(TType, TType, usize)>;
    fn read_list_begin(&mut self) -> Result<(TType, usize)>;

    fn read_set_begin(&mut self) -> Result<(TType, usize)> {
        self.read_list_begin()
    }

    /// Bytes left in the input.
    fn remaining(&self) -> usize;

    /// Consumes one value of `ttype` without materializing it.
    fn skip(&mut self, ttype: TType) -> Result<()>
    where
        Self: Sized,
    {
        match ttype {
            TType::Stop => return Err(ProtocolError::InvalidType(0)),
            TType::Bool => {
                self.read_bool()?;
            }
            TType::Byte => {
                self.read_byte()?;
            }
            TType::I16 => {
                self.read_i16()?;
            }
            TType::I32 => {
                self.read_i32()?;
            }
            TType::I64 => {
                self.read_i64()?;
            }
            TType::Double => {
                self.read_double()?;
            }
            TType::String => {
                self.read_binary()?;
            }
            TType::Struct => {
                self.read_struct_begin();
                while let Some((field_type, _)) = self.read_field_begin()? {
                    self.skip(field_type)?;
                }
                self.read_struct_end();
            }
            TType::Map => {
                let (key, value, size) = self.read_map_begin()?;
                for _ in 0..size {
                    self.skip(key)?;
                    self.skip(value)?;
                }
            }
            TType::Set | TType::List => {
                let (elem, size) = self.read_list_begin()?;
                for _ in 0..size {
                    self.skip(elem)?;
                }
            }
        }
        Ok(())
    }
}

/// Converts a wire length to `usize`, rejecting negatives.
pub(crate) fn checked_size(raw: i64) -> Result<usize> {
    usize::try_from(raw).map_err(|_| ProtocolError::NegativeSize(raw))
}

/// Converts an in-memory length to the i32 the wire carries.
pub(crate) fn wire_len(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| ProtocolError::Serialization(format!("length {} exceeds i32", len)))
}
