//! Binary protocol: fixed-width big-endian encoding.
//!
//! # Message Header
//!
//! - 4 bytes: `0x8001_0000 | kind` (strict, versioned)
//! - 4 bytes: method name length, then the name bytes
//! - 4 bytes: sequence id
//!
//! A non-negative first word is the legacy unversioned header: the word is
//! the name length, followed by the name, one kind byte and the sequence id.
//!
//! # Fields
//!
//! 1 byte type id + 2 byte field id, STOP is a single zero byte.

use crate::error::{ProtocolError, Result};

use super::{
    checked_size, wire_len, ByteCursor, MessageHeader, MessageKind, ProtocolRead, ProtocolWrite,
    TType,
};

/// Version tag carried in the first header word.
pub const VERSION_1: u32 = 0x8001_0000;

/// Mask selecting the version bits of the first header word.
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Binary protocol encoder.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
}

impl ProtocolWrite for BinaryWriter {
    fn write_message_begin(&mut self, name: &str, kind: MessageKind, seqid: i32) -> Result<()> {
        let word = VERSION_1 | u32::from(kind.as_u8());
        self.buf.extend_from_slice(&word.to_be_bytes());
        self.write_string(name)?;
        self.put_i32(seqid);
        Ok(())
    }

    fn write_struct_begin(&mut self) {}

    fn write_struct_end(&mut self) {}

    fn write_field_begin(&mut self, ttype: TType, id: i16) {
        self.buf.push(ttype.id());
        self.buf.extend_from_slice(&id.to_be_bytes());
    }

    fn write_field_stop(&mut self) {
        self.buf.push(TType::Stop.id());
    }

    fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn write_byte(&mut self, value: i8) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_i32(&mut self, value: i32) {
        self.put_i32(value);
    }

    fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_double(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.put_i32(wire_len(value.len())?);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn write_map_begin(&mut self, key: TType, value: TType, size: usize) -> Result<()> {
        self.buf.push(key.id());
        self.buf.push(value.id());
        self.put_i32(wire_len(size)?);
        Ok(())
    }

    fn write_list_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        self.buf.push(elem.id());
        self.put_i32(wire_len(size)?);
        Ok(())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Binary protocol decoder over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    cursor: ByteCursor<'a>,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: ByteCursor::new(data),
        }
    }

    fn read_type(&mut self) -> Result<TType> {
        TType::try_from(self.cursor.read_u8()?)
    }

    fn read_size(&mut self) -> Result<usize> {
        let raw = self.read_i32()?;
        let size = checked_size(i64::from(raw))?;
        self.cursor.ensure(size)?;
        Ok(size)
    }

    fn read_name(&mut self, len: usize) -> Result<String> {
        let bytes = self.cursor.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("method name"))
    }
}

impl<'a> ProtocolRead<'a> for BinaryReader<'a> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        let word = self.read_i32()?;
        if word < 0 {
            let word = word as u32;
            let version = word & VERSION_MASK;
            if version != VERSION_1 {
                return Err(ProtocolError::BadVersion(version));
            }
            let kind = MessageKind::from((word & 0xff) as u8);
            let len = self.read_size()?;
            let name = self.read_name(len)?;
            let seqid = self.read_i32()?;
            Ok(MessageHeader { name, kind, seqid })
        } else {
            let len = checked_size(i64::from(word))?;
            let name = self.read_name(len)?;
            let kind = MessageKind::from(self.cursor.read_u8()?);
            let seqid = self.read_i32()?;
            Ok(MessageHeader { name, kind, seqid })
        }
    }

    fn read_struct_begin(&mut self) {}

    fn read_struct_end(&mut self) {}

    fn read_field_begin(&mut self) -> Result<Option<(TType, i16)>> {
        let ttype = self.read_type()?;
        if ttype == TType::Stop {
            return Ok(None);
        }
        let id = self.read_i16()?;
        Ok(Some((ttype, id)))
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.cursor.read_u8()? == 1)
    }

    fn read_byte(&mut self) -> Result<i8> {
        Ok(i8::from_be_bytes(self.cursor.take_array()?))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.cursor.take_array()?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.cursor.take_array()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.cursor.take_array()?))
    }

    fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.cursor.take_array()?))
    }

    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let raw = self.read_i32()?;
        let len = checked_size(i64::from(raw))?;
        self.cursor.take(len)
    }

    fn read_map_begin(&mut self) -> Result<(TType, TType, usize)> {
        let key = self.read_type()?;
        let value = self.read_type()?;
        let size = self.read_size()?;
        Ok((key, value, size))
    }

    fn read_list_begin(&mut self) -> Result<(TType, usize)> {
        let elem = self.read_type()?;
        let size = self.read_size()?;
        Ok((elem, size))
    }

    fn remaining(&self) -> usize {
        self.cursor.remaining()
    }
}
