//! Dynamic value model produced by decoding.
//!
//! Every field of every struct is materialized, including ids the caller
//! does not know about. STRING payloads are kept as text only when they are
//! valid UTF-8; anything else stays [`WireValue::Binary`] so ciphertexts and
//! signatures keep their exact bytes.

use std::collections::BTreeMap;

use crate::error::{ProtocolError, Result};

use super::{ProtocolRead, TType};

/// Nesting limit for decoded containers and structs.
pub const MAX_DEPTH: usize = 512;

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    Byte(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    /// STRING payload that is valid UTF-8.
    String(String),
    /// STRING payload that is not valid UTF-8.
    Binary(Vec<u8>),
    Struct(StructValue),
    Map {
        key_type: TType,
        value_type: TType,
        entries: Vec<(WireValue, WireValue)>,
    },
    Set {
        elem_type: TType,
        items: Vec<WireValue>,
    },
    List {
        elem_type: TType,
        items: Vec<WireValue>,
    },
}

impl WireValue {
    /// Wire type this value is encoded as.
    pub fn ttype(&self) -> TType {
        match self {
            WireValue::Bool(_) => TType::Bool,
            WireValue::Byte(_) => TType::Byte,
            WireValue::I16(_) => TType::I16,
            WireValue::I32(_) => TType::I32,
            WireValue::I64(_) => TType::I64,
            WireValue::Double(_) => TType::Double,
            WireValue::String(_) | WireValue::Binary(_) => TType::String,
            WireValue::Struct(_) => TType::Struct,
            WireValue::Map { .. } => TType::Map,
            WireValue::Set { .. } => TType::Set,
            WireValue::List { .. } => TType::List,
        }
    }

    /// Any integer width widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            WireValue::Byte(v) => Some(i64::from(v)),
            WireValue::I16(v) => Some(i64::from(v)),
            WireValue::I32(v) => Some(i64::from(v)),
            WireValue::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Integer value if it fits in an i32.
    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            WireValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match *self {
            WireValue::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Text payload of a STRING value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of a STRING value, text or binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::String(s) => Some(s.as_bytes()),
            WireValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            WireValue::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a LIST or SET.
    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List { items, .. } | WireValue::Set { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(WireValue, WireValue)]> {
        match self {
            WireValue::Map { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Short shape name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireValue::Binary(_) => "binary",
            other => other.ttype().name(),
        }
    }
}

/// A decoded struct: field id to value, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructValue {
    fields: BTreeMap<i16, WireValue>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i16) -> Option<&WireValue> {
        self.fields.get(&id)
    }

    pub fn insert(&mut self, id: i16, value: WireValue) -> Option<WireValue> {
        self.fields.insert(id, value)
    }

    pub fn remove(&mut self, id: i16) -> Option<WireValue> {
        self.fields.remove(&id)
    }

    pub fn contains(&self, id: i16) -> bool {
        self.fields.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i16, &WireValue)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }

    pub fn i64(&self, id: i16) -> Option<i64> {
        self.get(id).and_then(WireValue::as_i64)
    }

    pub fn i32(&self, id: i16) -> Option<i32> {
        self.get(id).and_then(WireValue::as_i32)
    }

    pub fn bool(&self, id: i16) -> Option<bool> {
        self.get(id).and_then(WireValue::as_bool)
    }

    pub fn double(&self, id: i16) -> Option<f64> {
        self.get(id).and_then(WireValue::as_double)
    }

    pub fn str(&self, id: i16) -> Option<&str> {
        self.get(id).and_then(WireValue::as_str)
    }

    pub fn bytes(&self, id: i16) -> Option<&[u8]> {
        self.get(id).and_then(WireValue::as_bytes)
    }

    pub fn structure(&self, id: i16) -> Option<&StructValue> {
        self.get(id).and_then(WireValue::as_struct)
    }

    pub fn list(&self, id: i16) -> Option<&[WireValue]> {
        self.get(id).and_then(WireValue::as_list)
    }

    pub fn map(&self, id: i16) -> Option<&[(WireValue, WireValue)]> {
        self.get(id).and_then(WireValue::as_map)
    }

    /// String-to-string entries of a MAP field; other entry shapes are skipped.
    pub fn string_map(&self, id: i16) -> BTreeMap<String, String> {
        self.map(id)
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
            .collect()
    }
}

impl FromIterator<(i16, WireValue)> for StructValue {
    fn from_iter<I: IntoIterator<Item = (i16, WireValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StructValue {
    type Item = (i16, WireValue);
    type IntoIter = std::collections::btree_map::IntoIter<i16, WireValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Reads one value of `ttype`.
pub fn read_value<'a, R: ProtocolRead<'a>>(reader: &mut R, ttype: TType) -> Result<WireValue> {
    read_value_at(reader, ttype, 0)
}

/// Reads struct fields up to and including the STOP marker.
pub fn read_struct<'a, R: ProtocolRead<'a>>(reader: &mut R) -> Result<StructValue> {
    read_struct_at(reader, 0)
}

fn read_struct_at<'a, R: ProtocolRead<'a>>(reader: &mut R, depth: usize) -> Result<StructValue> {
    reader.read_struct_begin();
    let mut out = StructValue::new();
    while let Some((ttype, id)) = reader.read_field_begin()? {
        let value = read_value_at(reader, ttype, depth + 1)?;
        out.insert(id, value);
    }
    reader.read_struct_end();
    Ok(out)
}

fn read_value_at<'a, R: ProtocolRead<'a>>(
    reader: &mut R,
    ttype: TType,
    depth: usize,
) -> Result<WireValue> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::Deserialization(format!(
            "nesting deeper than {}",
            MAX_DEPTH
        )));
    }
    Ok(match ttype {
        TType::Stop => return Err(ProtocolError::InvalidType(TType::Stop.id())),
        TType::Bool => WireValue::Bool(reader.read_bool()?),
        TType::Byte => WireValue::Byte(reader.read_byte()?),
        TType::I16 => WireValue::I16(reader.read_i16()?),
        TType::I32 => WireValue::I32(reader.read_i32()?),
        TType::I64 => WireValue::I64(reader.read_i64()?),
        TType::Double => WireValue::Double(reader.read_double()?),
        TType::String => {
            let raw = reader.read_binary()?;
            match std::str::from_utf8(raw) {
                Ok(text) => WireValue::String(text.to_string()),
                Err(_) => WireValue::Binary(raw.to_vec()),
            }
        }
        TType::Struct => WireValue::Struct(read_struct_at(reader, depth)?),
        TType::Map => {
            let (key_type, value_type, size) = reader.read_map_begin()?;
            let mut entries = Vec::with_capacity(size);
            for _ in 0..size {
                let key = read_value_at(reader, key_type, depth + 1)?;
                let value = read_value_at(reader, value_type, depth + 1)?;
                entries.push((key, value));
            }
            WireValue::Map {
                key_type,
                value_type,
                entries,
            }
        }
        TType::Set => {
            let (elem_type, size) = reader.read_set_begin()?;
            WireValue::Set {
                elem_type,
                items: read_items(reader, elem_type, size, depth)?,
            }
        }
        TType::List => {
            let (elem_type, size) = reader.read_list_begin()?;
            WireValue::List {
                elem_type,
                items: read_items(reader, elem_type, size, depth)?,
            }
        }
    })
}

fn read_items<'a, R: ProtocolRead<'a>>(
    reader: &mut R,
    elem_type: TType,
    size: usize,
    depth: usize,
) -> Result<Vec<WireValue>> {
    let mut items = Vec::with_capacity(size);
    for _ in 0..size {
        items.push(read_value_at(reader, elem_type, depth + 1)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BinaryReader, BinaryWriter, CompactReader, CompactWriter, ProtocolWrite};

    #[test]
    fn test_invalid_utf8_stays_binary() {
        let mut writer = CompactWriter::new();
        writer.write_binary(&[0xff, 0xfe, 0x00]).unwrap();
        let bytes = writer.into_bytes();

        let value = read_value(&mut CompactReader::new(&bytes), TType::String).unwrap();
        assert_eq!(value, WireValue::Binary(vec![0xff, 0xfe, 0x00]));
        assert_eq!(value.as_str(), None);
        assert_eq!(value.as_bytes(), Some(&[0xff, 0xfe, 0x00][..]));
    }

    #[test]
    fn test_utf8_decodes_as_text() {
        let mut writer = BinaryWriter::new();
        writer.write_string("héllo").unwrap();
        let bytes = writer.into_bytes();

        let value = read_value(&mut BinaryReader::new(&bytes), TType::String).unwrap();
        assert_eq!(value, WireValue::String("héllo".to_string()));
    }

    #[test]
    fn test_struct_keeps_unknown_fields() {
        let mut writer = CompactWriter::new();
        writer.write_field_begin(TType::I64, 1);
        writer.write_i64(5);
        writer.write_field_begin(TType::String, 900);
        writer.write_string("future").unwrap();
        writer.write_field_stop();
        let bytes = writer.into_bytes();

        let parsed = read_struct(&mut CompactReader::new(&bytes)).unwrap();
        assert_eq!(parsed.i64(1), Some(5));
        assert_eq!(parsed.str(900), Some("future"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_getters_widen_integers() {
        let value: StructValue = [
            (1, WireValue::I16(7)),
            (2, WireValue::I64(i64::from(i32::MAX) + 1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(value.i32(1), Some(7));
        assert_eq!(value.i64(2), Some(i64::from(i32::MAX) + 1));
        assert_eq!(value.i32(2), None);
        assert_eq!(value.str(1), None);
    }

    #[test]
    fn test_string_map_skips_non_text() {
        let value: StructValue = [(
            18,
            WireValue::Map {
                key_type: TType::String,
                value_type: TType::String,
                entries: vec![
                    (
                        WireValue::String("a".into()),
                        WireValue::String("1".into()),
                    ),
                    (WireValue::String("b".into()), WireValue::Binary(vec![0xff])),
                ],
            },
        )]
        .into_iter()
        .collect();
        let map = value.string_map(18);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert!(value.string_map(19).is_empty());
    }

    #[test]
    fn test_truncated_struct_is_eof() {
        let mut writer = BinaryWriter::new();
        writer.write_field_begin(TType::I64, 1);
        let mut bytes = writer.into_bytes();
        bytes.extend_from_slice(&[0, 0, 0]);
        let err = read_struct(&mut BinaryReader::new(&bytes)).unwrap_err();
        assert!(err.is_truncation());
    }

    #[test]
    fn test_nesting_limit() {
        let mut bytes = Vec::new();
        for _ in 0..(MAX_DEPTH + 2) {
            // LIST of one LIST
            bytes.push(0x19);
        }
        let err = read_value(&mut CompactReader::new(&bytes), TType::List).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
