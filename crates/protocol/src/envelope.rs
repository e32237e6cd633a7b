//! Envelope builder and message parser.
//!
//! An [`Envelope`] is an ordered list of `(type, id, value)` triples that
//! becomes the argument struct of an RPC call. [`encode`] prefixes it with a
//! call header; [`decode`] turns a reply back into a [`ParsedMessage`].
//!
//! ```rust
//! use protocol::envelope::{decode, encode, Envelope, Field};
//! use protocol::wire::ProtocolKind;
//!
//! let envelope = Envelope::new()
//!     .with(Field::i32(1, 42))
//!     .with(Field::string(2, "hello"));
//! let bytes = encode(&envelope, "testMethod", ProtocolKind::Compact).unwrap();
//! let parsed = decode(&bytes, ProtocolKind::Compact).unwrap();
//! assert_eq!(parsed.method, "testMethod");
//! assert_eq!(parsed.fields.i32(1), Some(42));
//! assert_eq!(parsed.fields.str(2), Some("hello"));
//! ```

use crate::error::{ProtocolError, Result};
use crate::wire::value::{read_struct, StructValue, WireValue};
use crate::wire::{
    BinaryReader, BinaryWriter, CompactReader, CompactWriter, MessageKind, ProtocolKind,
    ProtocolRead, ProtocolWrite, TType,
};

/// Input value of an envelope field.
///
/// Integers of every width share [`Value::Int`]; the declared field type
/// decides the width and the range check.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    Struct(Envelope),
    /// `None` items make the field absent rather than empty.
    List {
        elem: TType,
        items: Option<Vec<Value>>,
    },
    Set {
        elem: TType,
        items: Option<Vec<Value>>,
    },
    Map {
        key: TType,
        value: TType,
        entries: Option<Vec<(Value, Value)>>,
    },
}

impl Value {
    fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Struct(_) => "struct",
            Value::List { .. } => "list",
            Value::Set { .. } => "set",
            Value::Map { .. } => "map",
        }
    }

    /// True for containers whose items are absent.
    fn is_absent(&self) -> bool {
        match self {
            Value::List { items, .. } | Value::Set { items, .. } => items.is_none(),
            Value::Map { entries, .. } => entries.is_none(),
            _ => false,
        }
    }

    pub fn list(elem: TType, items: Vec<Value>) -> Self {
        Value::List {
            elem,
            items: Some(items),
        }
    }

    pub fn map(key: TType, value: TType, entries: Vec<(Value, Value)>) -> Self {
        Value::Map {
            key,
            value,
            entries: Some(entries),
        }
    }
}

macro_rules! int_value_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

int_value_from!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Envelope> for Value {
    fn from(v: Envelope) -> Self {
        Value::Struct(v)
    }
}

impl From<WireValue> for Value {
    fn from(v: WireValue) -> Self {
        match v {
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Byte(n) => Value::Int(i64::from(n)),
            WireValue::I16(n) => Value::Int(i64::from(n)),
            WireValue::I32(n) => Value::Int(i64::from(n)),
            WireValue::I64(n) => Value::Int(n),
            WireValue::Double(d) => Value::Double(d),
            WireValue::String(s) => Value::Str(s),
            WireValue::Binary(b) => Value::Bytes(b),
            WireValue::Struct(s) => Value::Struct(Envelope::from(s)),
            WireValue::Map {
                key_type,
                value_type,
                entries,
            } => Value::Map {
                key: key_type,
                value: value_type,
                entries: Some(
                    entries
                        .into_iter()
                        .map(|(k, v)| (Value::from(k), Value::from(v)))
                        .collect(),
                ),
            },
            WireValue::Set { elem_type, items } => Value::Set {
                elem: elem_type,
                items: Some(items.into_iter().map(Value::from).collect()),
            },
            WireValue::List { elem_type, items } => Value::List {
                elem: elem_type,
                items: Some(items.into_iter().map(Value::from).collect()),
            },
        }
    }
}

/// One `(type, id, value)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub ttype: TType,
    pub id: i16,
    pub value: Value,
}

impl Field {
    pub fn new(ttype: TType, id: i16, value: impl Into<Value>) -> Self {
        Self {
            ttype,
            id,
            value: value.into(),
        }
    }

    pub fn bool(id: i16, value: bool) -> Self {
        Self::new(TType::Bool, id, value)
    }

    pub fn i32(id: i16, value: i32) -> Self {
        Self::new(TType::I32, id, value)
    }

    pub fn i64(id: i16, value: i64) -> Self {
        Self::new(TType::I64, id, value)
    }

    pub fn double(id: i16, value: f64) -> Self {
        Self::new(TType::Double, id, value)
    }

    pub fn string(id: i16, value: impl Into<String>) -> Self {
        Self::new(TType::String, id, Value::Str(value.into()))
    }

    pub fn binary(id: i16, value: impl Into<Vec<u8>>) -> Self {
        Self::new(TType::String, id, Value::Bytes(value.into()))
    }

    pub fn structure(id: i16, value: Envelope) -> Self {
        Self::new(TType::Struct, id, value)
    }

    pub fn list(id: i16, elem: TType, items: Option<Vec<Value>>) -> Self {
        Self::new(TType::List, id, Value::List { elem, items })
    }

    pub fn set(id: i16, elem: TType, items: Option<Vec<Value>>) -> Self {
        Self::new(TType::Set, id, Value::Set { elem, items })
    }

    pub fn map(id: i16, key: TType, value: TType, entries: Option<Vec<(Value, Value)>>) -> Self {
        Self::new(
            TType::Map,
            id,
            Value::Map {
                key,
                value,
                entries,
            },
        )
    }

    /// Re-wraps a decoded value under `id` with its own wire type.
    pub fn from_wire(id: i16, value: WireValue) -> Self {
        Self::new(value.ttype(), id, value)
    }
}

/// Ordered fields of one struct.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    fields: Vec<Field>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn with(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Appends a field when present; `None` is dropped.
    pub fn with_opt(mut self, field: Option<Field>) -> Self {
        if let Some(field) = field {
            self.fields.push(field);
        }
        self
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

impl FromIterator<Field> for Envelope {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl FromIterator<Option<Field>> for Envelope {
    fn from_iter<I: IntoIterator<Item = Option<Field>>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().flatten().collect(),
        }
    }
}

impl From<StructValue> for Envelope {
    fn from(value: StructValue) -> Self {
        value
            .into_iter()
            .map(|(id, v)| Field::from_wire(id, v))
            .collect()
    }
}

/// A decoded RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub method: String,
    pub kind: MessageKind,
    pub seqid: i32,
    pub fields: StructValue,
}

/// Encodes `envelope` as the argument struct of a call to `method`.
///
/// Output is the call header, the struct body, and one closing STOP. A body
/// consisting of nothing but its STOP is dropped before the closing STOP is
/// appended.
pub fn encode(envelope: &Envelope, method: &str, protocol: ProtocolKind) -> Result<Vec<u8>> {
    match protocol {
        ProtocolKind::Binary => encode_with::<BinaryWriter>(envelope, method),
        ProtocolKind::Compact => encode_with::<CompactWriter>(envelope, method),
    }
}

/// Encodes `envelope` as a bare struct (fields + STOP), without a header.
pub fn encode_struct(envelope: &Envelope, protocol: ProtocolKind) -> Result<Vec<u8>> {
    fn run<W: ProtocolWrite + Default>(envelope: &Envelope) -> Result<Vec<u8>> {
        let mut writer = W::default();
        write_struct(&mut writer, envelope)?;
        Ok(writer.into_bytes())
    }
    match protocol {
        ProtocolKind::Binary => run::<BinaryWriter>(envelope),
        ProtocolKind::Compact => run::<CompactWriter>(envelope),
    }
}

/// Parses a full message: header, then the result struct.
pub fn decode(bytes: &[u8], protocol: ProtocolKind) -> Result<ParsedMessage> {
    match protocol {
        ProtocolKind::Binary => decode_with(&mut BinaryReader::new(bytes)),
        ProtocolKind::Compact => decode_with(&mut CompactReader::new(bytes)),
    }
}

/// Parses a bare struct with no message header.
pub fn decode_struct(bytes: &[u8], protocol: ProtocolKind) -> Result<StructValue> {
    match protocol {
        ProtocolKind::Binary => read_struct(&mut BinaryReader::new(bytes)),
        ProtocolKind::Compact => read_struct(&mut CompactReader::new(bytes)),
    }
}

fn encode_with<W: ProtocolWrite + Default>(envelope: &Envelope, method: &str) -> Result<Vec<u8>> {
    let mut header = W::default();
    header.write_message_begin(method, MessageKind::Call, 0)?;

    let mut body = W::default();
    write_struct(&mut body, envelope)?;
    let mut body = body.into_bytes();
    if body == [TType::Stop.id()] {
        body.clear();
    }

    let mut out = header.into_bytes();
    out.extend_from_slice(&body);
    out.push(TType::Stop.id());
    Ok(out)
}

fn decode_with<'a, R: ProtocolRead<'a>>(reader: &mut R) -> Result<ParsedMessage> {
    let header = reader.read_message_begin()?;
    let fields = read_struct(reader)?;
    Ok(ParsedMessage {
        method: header.name,
        kind: header.kind,
        seqid: header.seqid,
        fields,
    })
}

fn write_struct<W: ProtocolWrite>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    writer.write_struct_begin();
    for field in envelope.fields() {
        if field.value.is_absent() {
            continue;
        }
        if let Value::Struct(inner) = &field.value {
            if inner.is_empty() {
                continue;
            }
        }
        writer.write_field_begin(field.ttype, field.id);
        write_value(writer, field.ttype, &field.value, field.id)?;
    }
    writer.write_field_stop();
    writer.write_struct_end();
    Ok(())
}

fn mismatch(field: i16, ttype: TType, value: &Value) -> ProtocolError {
    ProtocolError::TypeMismatch {
        field,
        expected: ttype.name(),
        got: value.kind_name(),
    }
}

fn int_in<T: TryFrom<i64>>(value: i64, ttype: TType) -> Result<T> {
    T::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange {
        value,
        ttype: ttype.name(),
    })
}

fn write_value<W: ProtocolWrite>(
    writer: &mut W,
    ttype: TType,
    value: &Value,
    field: i16,
) -> Result<()> {
    match (ttype, value) {
        (TType::Bool, Value::Bool(b)) => writer.write_bool(*b),
        (TType::Byte, Value::Int(n)) => writer.write_byte(int_in(*n, ttype)?),
        (TType::I16, Value::Int(n)) => writer.write_i16(int_in(*n, ttype)?),
        (TType::I32, Value::Int(n)) => writer.write_i32(int_in(*n, ttype)?),
        (TType::I64, Value::Int(n)) => writer.write_i64(*n),
        (TType::Double, Value::Double(d)) => writer.write_double(*d),
        (TType::Double, Value::Int(n)) => writer.write_double(*n as f64),
        (TType::String, Value::Str(s)) => writer.write_string(s)?,
        (TType::String, Value::Bytes(b)) => writer.write_binary(b)?,
        (TType::Struct, Value::Struct(inner)) => write_struct(writer, inner)?,
        (TType::List, Value::List { elem, items }) => {
            let items = items.as_deref().unwrap_or_default();
            writer.write_list_begin(*elem, items.len())?;
            for item in items {
                write_value(writer, *elem, item, field)?;
            }
        }
        (TType::Set, Value::Set { elem, items }) => {
            let items = items.as_deref().unwrap_or_default();
            writer.write_set_begin(*elem, items.len())?;
            for item in items {
                write_value(writer, *elem, item, field)?;
            }
        }
        (
            TType::Map,
            Value::Map {
                key,
                value: value_type,
                entries,
            },
        ) => {
            let entries = entries.as_deref().unwrap_or_default();
            writer.write_map_begin(*key, *value_type, entries.len())?;
            for (k, v) in entries {
                write_value(writer, *key, k, field)?;
                write_value(writer, *value_type, v, field)?;
            }
        }
        _ => return Err(mismatch(field, ttype, value)),
    }
    Ok(())
}
