//! Compact protocol: zigzag varints and delta-encoded field ids.
//!
//! # Message Header
//!
//! - 1 byte: protocol id `0x82`
//! - 1 byte: `version (low 5 bits) | kind << 5`
//! - varint: sequence id
//! - varint length + method name bytes
//!
//! # Fields
//!
//! When the id delta from the previous field of the same struct is in
//! `1..=15` the header is a single byte `delta << 4 | type`; otherwise the
//! type byte is followed by the zigzag-encoded id. Booleans that are direct
//! struct fields carry their value in the type nibble (1 true, 2 false) and
//! have no body.

use crate::error::{ProtocolError, Result};

use super::{
    checked_size, wire_len, ByteCursor, MessageHeader, MessageKind, ProtocolRead, ProtocolWrite,
    TType,
};

/// First byte of every Compact message.
pub const PROTOCOL_ID: u8 = 0x82;

/// Only supported Compact version.
pub const VERSION: u8 = 1;

const VERSION_MASK: u8 = 0x1f;
const KIND_SHIFT: u8 = 5;

/// Longest LEB128 encoding of a 64-bit value.
const MAX_VARINT_LEN: usize = 10;

/// Compact type codes.
mod ctype {
    pub const STOP: u8 = 0;
    pub const BOOL_TRUE: u8 = 1;
    pub const BOOL_FALSE: u8 = 2;
    pub const BYTE: u8 = 3;
    pub const I16: u8 = 4;
    pub const I32: u8 = 5;
    pub const I64: u8 = 6;
    pub const DOUBLE: u8 = 7;
    pub const BINARY: u8 = 8;
    pub const LIST: u8 = 9;
    pub const SET: u8 = 10;
    pub const MAP: u8 = 11;
    pub const STRUCT: u8 = 12;
}

fn to_ctype(ttype: TType) -> u8 {
    match ttype {
        TType::Stop => ctype::STOP,
        // container elements use the FALSE code as the bool marker
        TType::Bool => ctype::BOOL_FALSE,
        TType::Byte => ctype::BYTE,
        TType::I16 => ctype::I16,
        TType::I32 => ctype::I32,
        TType::I64 => ctype::I64,
        TType::Double => ctype::DOUBLE,
        TType::String => ctype::BINARY,
        TType::List => ctype::LIST,
        TType::Set => ctype::SET,
        TType::Map => ctype::MAP,
        TType::Struct => ctype::STRUCT,
    }
}

fn from_ctype(code: u8) -> Result<TType> {
    Ok(match code {
        ctype::STOP => TType::Stop,
        ctype::BOOL_TRUE | ctype::BOOL_FALSE => TType::Bool,
        ctype::BYTE => TType::Byte,
        ctype::I16 => TType::I16,
        ctype::I32 => TType::I32,
        ctype::I64 => TType::I64,
        ctype::DOUBLE => TType::Double,
        ctype::BINARY => TType::String,
        ctype::LIST => TType::List,
        ctype::SET => TType::Set,
        ctype::MAP => TType::Map,
        ctype::STRUCT => TType::Struct,
        other => return Err(ProtocolError::InvalidType(other)),
    })
}

/// Maps a signed integer onto an unsigned one so small magnitudes stay small.
#[inline]
pub fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Appends `value` as an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Reads an unsigned LEB128 varint of at most ten bytes.
pub fn read_varint(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let mut result = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = cursor.read_u8()?;
        result |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ProtocolError::Deserialization("varint too long".to_string()))
}

/// Compact protocol encoder.
#[derive(Debug, Default)]
pub struct CompactWriter {
    buf: Vec<u8>,
    last_field_id: i16,
    field_stack: Vec<i16>,
    pending_bool: Option<i16>,
}

impl CompactWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn write_field_header(&mut self, code: u8, id: i16) {
        let delta = i32::from(id) - i32::from(self.last_field_id);
        if (1..=15).contains(&delta) {
            self.buf.push(((delta as u8) << 4) | code);
        } else {
            self.buf.push(code);
            write_varint(&mut self.buf, zigzag_encode(i64::from(id)));
        }
        self.last_field_id = id;
    }

    fn write_size(&mut self, size: usize) -> Result<()> {
        let size = wire_len(size)?;
        write_varint(&mut self.buf, size as u64);
        Ok(())
    }
}

impl ProtocolWrite for CompactWriter {
    fn write_message_begin(&mut self, name: &str, kind: MessageKind, seqid: i32) -> Result<()> {
        self.buf.push(PROTOCOL_ID);
        self.buf
            .push((VERSION & VERSION_MASK) | (kind.as_u8() << KIND_SHIFT));
        write_varint(&mut self.buf, u64::from(seqid as u32));
        self.write_string(name)
    }

    fn write_struct_begin(&mut self) {
        self.field_stack.push(self.last_field_id);
        self.last_field_id = 0;
    }

    fn write_struct_end(&mut self) {
        self.last_field_id = self.field_stack.pop().unwrap_or(0);
    }

    fn write_field_begin(&mut self, ttype: TType, id: i16) {
        if ttype == TType::Bool {
            self.pending_bool = Some(id);
        } else {
            self.write_field_header(to_ctype(ttype), id);
        }
    }

    fn write_field_stop(&mut self) {
        self.buf.push(ctype::STOP);
    }

    fn write_bool(&mut self, value: bool) {
        match self.pending_bool.take() {
            Some(id) => {
                let code = if value {
                    ctype::BOOL_TRUE
                } else {
                    ctype::BOOL_FALSE
                };
                self.write_field_header(code, id);
            }
            None => self.buf.push(u8::from(value)),
        }
    }

    fn write_byte(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    fn write_i16(&mut self, value: i16) {
        write_varint(&mut self.buf, zigzag_encode(i64::from(value)));
    }

    fn write_i32(&mut self, value: i32) {
        write_varint(&mut self.buf, zigzag_encode(i64::from(value)));
    }

    fn write_i64(&mut self, value: i64) {
        write_varint(&mut self.buf, zigzag_encode(value));
    }

    fn write_double(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_size(value.len())?;
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn write_map_begin(&mut self, key: TType, value: TType, size: usize) -> Result<()> {
        if size == 0 {
            self.buf.push(0);
            return Ok(());
        }
        self.write_size(size)?;
        self.buf.push((to_ctype(key) << 4) | to_ctype(value));
        Ok(())
    }

    fn write_list_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        let code = to_ctype(elem);
        if size < 15 {
            self.buf.push(((size as u8) << 4) | code);
        } else {
            self.buf.push(0xf0 | code);
            self.write_size(size)?;
        }
        Ok(())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Compact protocol decoder over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct CompactReader<'a> {
    cursor: ByteCursor<'a>,
    last_field_id: i16,
    field_stack: Vec<i16>,
    pending_bool: Option<bool>,
}

impl<'a> CompactReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: ByteCursor::new(data),
            last_field_id: 0,
            field_stack: Vec::new(),
            pending_bool: None,
        }
    }

    fn read_zigzag(&mut self) -> Result<i64> {
        Ok(zigzag_decode(read_varint(&mut self.cursor)?))
    }

    /// Reads a 32-bit varint length; values with the sign bit set are negative.
    fn read_size(&mut self) -> Result<usize> {
        let raw = read_varint(&mut self.cursor)?;
        let raw = u32::try_from(raw)
            .map_err(|_| ProtocolError::Deserialization(format!("size {} exceeds i32", raw)))?;
        let size = checked_size(i64::from(raw as i32))?;
        self.cursor.ensure(size)?;
        Ok(size)
    }
}

impl<'a> ProtocolRead<'a> for CompactReader<'a> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        let protocol_id = self.cursor.read_u8()?;
        if protocol_id != PROTOCOL_ID {
            return Err(ProtocolError::ProtocolMismatch {
                expected: PROTOCOL_ID,
                got: protocol_id,
            });
        }
        let version_and_kind = self.cursor.read_u8()?;
        let version = version_and_kind & VERSION_MASK;
        if version != VERSION {
            return Err(ProtocolError::BadVersion(u32::from(version)));
        }
        let kind = MessageKind::from(version_and_kind >> KIND_SHIFT);
        let seqid = read_varint(&mut self.cursor)? as u32 as i32;
        let name = self.read_binary()?;
        let name = std::str::from_utf8(name)
            .map_err(|_| ProtocolError::InvalidUtf8("method name"))?
            .to_string();
        Ok(MessageHeader { name, kind, seqid })
    }

    fn read_struct_begin(&mut self) {
        self.field_stack.push(self.last_field_id);
        self.last_field_id = 0;
    }

    fn read_struct_end(&mut self) {
        self.last_field_id = self.field_stack.pop().unwrap_or(0);
    }

    fn read_field_begin(&mut self) -> Result<Option<(TType, i16)>> {
        let byte = self.cursor.read_u8()?;
        let code = byte & 0x0f;
        if code == ctype::STOP {
            return Ok(None);
        }
        let ttype = from_ctype(code)?;
        let delta = byte >> 4;
        let id = if delta == 0 {
            let raw = self.read_zigzag()?;
            i16::try_from(raw)
                .map_err(|_| ProtocolError::Deserialization(format!("field id {} out of range", raw)))?
        } else {
            self.last_field_id
                .checked_add(i16::from(delta))
                .ok_or_else(|| ProtocolError::Deserialization("field id overflow".to_string()))?
        };
        if ttype == TType::Bool {
            self.pending_bool = Some(code == ctype::BOOL_TRUE);
        }
        self.last_field_id = id;
        Ok(Some((ttype, id)))
    }

    fn read_bool(&mut self) -> Result<bool> {
        match self.pending_bool.take() {
            Some(value) => Ok(value),
            None => Ok(self.cursor.read_u8()? == 1),
        }
    }

    fn read_byte(&mut self) -> Result<i8> {
        Ok(self.cursor.read_u8()? as i8)
    }

    fn read_i16(&mut self) -> Result<i16> {
        let raw = self.read_zigzag()?;
        i16::try_from(raw)
            .map_err(|_| ProtocolError::Deserialization(format!("i16 value {} out of range", raw)))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let raw = self.read_zigzag()?;
        i32::try_from(raw)
            .map_err(|_| ProtocolError::Deserialization(format!("i32 value {} out of range", raw)))
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.read_zigzag()
    }

    fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.cursor.take_array()?))
    }

    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_size()?;
        self.cursor.take(len)
    }

    fn read_map_begin(&mut self) -> Result<(TType, TType, usize)> {
        let size = self.read_size()?;
        if size == 0 {
            return Ok((TType::Stop, TType::Stop, 0));
        }
        let types = self.cursor.read_u8()?;
        let key = from_ctype(types >> 4)?;
        let value = from_ctype(types & 0x0f)?;
        Ok((key, value, size))
    }

    fn read_list_begin(&mut self) -> Result<(TType, usize)> {
        let header = self.cursor.read_u8()?;
        let elem = from_ctype(header & 0x0f)?;
        let short = header >> 4;
        let size = if short == 0x0f {
            self.read_size()?
        } else {
            let size = usize::from(short);
            self.cursor.ensure(size)?;
            size
        };
        Ok((elem, size))
    }

    fn remaining(&self) -> usize {
        self.cursor.remaining()
    }
}
