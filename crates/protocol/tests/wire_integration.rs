//! Integration tests for the protocol crate.
//!
//! These tests verify complete flows across modules:
//! - Envelope encode / decode round-trips under both encodings
//! - Binary-vs-text preservation
//! - Message seal / open between two parties

use std::collections::HashMap;

use protocol::crypto::{self, AadContext, KeyPair, MessageChunks};
use protocol::envelope::{decode, decode_struct, encode, encode_struct, Envelope, Field, Value};
use protocol::wire::{ProtocolKind, StructValue, TType, WireValue};
use protocol::ProtocolError;

const BOTH: [ProtocolKind; 2] = [ProtocolKind::Binary, ProtocolKind::Compact];

fn roundtrip(envelope: &Envelope, protocol: ProtocolKind) -> StructValue {
    let bytes = encode(envelope, "roundtrip", protocol).unwrap();
    let parsed = decode(&bytes, protocol).unwrap();
    assert_eq!(parsed.method, "roundtrip");
    parsed.fields
}

/// A struct exercising every wire type, nested containers included.
fn sample_struct() -> StructValue {
    let inner: StructValue = [
        (1, WireValue::String("inner".to_string())),
        (2, WireValue::Bool(false)),
    ]
    .into_iter()
    .collect();

    [
        (1, WireValue::Bool(true)),
        (2, WireValue::Byte(-7)),
        (3, WireValue::I16(i16::MIN)),
        (4, WireValue::I32(i32::MAX)),
        (5, WireValue::I64(i64::MIN)),
        (6, WireValue::Double(-2.5)),
        (7, WireValue::String("日本語 text".to_string())),
        (8, WireValue::Binary(vec![0x00, 0xc3, 0x28, 0xff])),
        (20, WireValue::Struct(inner.clone())),
        (
            21,
            WireValue::List {
                elem_type: TType::Struct,
                items: vec![WireValue::Struct(inner.clone()), WireValue::Struct(inner)],
            },
        ),
        (
            22,
            WireValue::Set {
                elem_type: TType::I64,
                items: vec![WireValue::I64(1), WireValue::I64(-1)],
            },
        ),
        (
            23,
            WireValue::Map {
                key_type: TType::String,
                value_type: TType::List,
                entries: vec![(
                    WireValue::String("k".to_string()),
                    WireValue::List {
                        elem_type: TType::Bool,
                        items: vec![WireValue::Bool(true), WireValue::Bool(false)],
                    },
                )],
            },
        ),
        (
            300,
            WireValue::List {
                elem_type: TType::I32,
                items: (0..40).map(WireValue::I32).collect(),
            },
        ),
    ]
    .into_iter()
    .collect()
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn test_every_type_roundtrips_both_protocols() {
    let original = sample_struct();
    for protocol in BOTH {
        let envelope = Envelope::from(original.clone());
        assert_eq!(roundtrip(&envelope, protocol), original, "{:?}", protocol);
    }
}

#[test]
fn test_bare_struct_roundtrip() {
    let original = sample_struct();
    for protocol in BOTH {
        let bytes = encode_struct(&Envelope::from(original.clone()), protocol).unwrap();
        assert_eq!(decode_struct(&bytes, protocol).unwrap(), original);
    }
}

#[test]
fn test_deeply_nested_structs() {
    let mut envelope = Envelope::new().with(Field::i32(1, 0));
    for depth in 1..50 {
        envelope = Envelope::new()
            .with(Field::i32(1, depth))
            .with(Field::structure(2, envelope));
    }
    for protocol in BOTH {
        let mut fields = roundtrip(&envelope, protocol);
        let mut depth = 49;
        while let Some(next) = fields.structure(2).cloned() {
            assert_eq!(fields.i32(1), Some(depth));
            fields = next;
            depth -= 1;
        }
        assert_eq!(depth, 0);
    }
}

#[test]
fn test_binary_payload_never_becomes_text() {
    // lone continuation byte, overlong encoding, surrogate half
    let blobs: [&[u8]; 3] = [&[0x80], &[0xc0, 0xaf], &[0xed, 0xa0, 0x80]];
    for protocol in BOTH {
        for blob in blobs {
            let envelope = Envelope::new().with(Field::binary(1, blob.to_vec()));
            let fields = roundtrip(&envelope, protocol);
            assert_eq!(fields.get(1), Some(&WireValue::Binary(blob.to_vec())));
        }
    }
}

#[test]
fn test_utf8_bytes_decode_as_text() {
    for protocol in BOTH {
        let envelope = Envelope::new().with(Field::binary(1, "plain".as_bytes().to_vec()));
        let fields = roundtrip(&envelope, protocol);
        assert_eq!(fields.str(1), Some("plain"));
    }
}

#[test]
fn test_truncated_input_is_fatal() {
    let envelope = Envelope::from(sample_struct());
    for protocol in BOTH {
        let bytes = encode(&envelope, "m", protocol).unwrap();
        // drop the closing STOP and the struct STOP, then keep cutting
        for cut in [bytes.len() - 2, bytes.len() / 2, 3] {
            let err = decode(&bytes[..cut], protocol).unwrap_err();
            assert!(err.is_truncation(), "{:?} cut {}: {}", protocol, cut, err);
        }
    }
}

// =============================================================================
// Concrete Scenarios
// =============================================================================

#[test]
fn test_scenario_compact_method_and_fields() {
    let envelope = Envelope::new()
        .with(Field::i32(1, 42))
        .with(Field::string(2, "hello"));
    let bytes = encode(&envelope, "testMethod", ProtocolKind::Compact).unwrap();
    let parsed = decode(&bytes, ProtocolKind::Compact).unwrap();

    assert_eq!(parsed.method, "testMethod");
    assert_eq!(parsed.fields.len(), 2);
    assert_eq!(parsed.fields.get(1), Some(&WireValue::I32(42)));
    assert_eq!(parsed.fields.get(2), Some(&WireValue::String("hello".into())));
}

#[test]
fn test_scenario_string_to_i32_map() {
    for protocol in BOTH {
        let envelope = Envelope::new().with(Field::map(
            1,
            TType::String,
            TType::I32,
            Some(vec![
                (Value::from("key1"), Value::from(1i32)),
                (Value::from("key2"), Value::from(2i32)),
            ]),
        ));
        let fields = roundtrip(&envelope, protocol);
        let decoded: HashMap<&str, i32> = fields
            .map(1)
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str().unwrap(), v.as_i32().unwrap()))
            .collect();
        let expected: HashMap<&str, i32> = [("key1", 1), ("key2", 2)].into_iter().collect();
        assert_eq!(decoded, expected);
    }
}

#[test]
fn test_scenario_individual_message_to_key_five() {
    let sender = KeyPair::generate();
    let receiver = KeyPair::generate();
    let payload = br#"{"text":"hello from x"}"#;

    let sender_secret = crypto::shared_secret(sender.private_key(), receiver.public_key()).unwrap();
    let aad = AadContext {
        to: "uyyyy",
        from: "uxxxx",
        sender_key_id: 9,
        receiver_key_id: 5,
        spec_version: 2,
        content_type: 0,
    };
    let wire_chunks = crypto::seal_message(&sender_secret, &aad, payload)
        .unwrap()
        .to_chunks();

    // receiver side: key ids come from the chunks
    let chunks = MessageChunks::from_chunks(&wire_chunks[..]).unwrap();
    assert_eq!(chunks.receiver_key_id, 5);
    let receiver_secret =
        crypto::shared_secret(receiver.private_key(), sender.public_key()).unwrap();
    let receiver_aad = AadContext {
        to: "uyyyy",
        from: "uxxxx",
        sender_key_id: chunks.sender_key_id,
        receiver_key_id: chunks.receiver_key_id,
        spec_version: 2,
        content_type: 0,
    };
    let opened = crypto::open_message(&receiver_secret, &receiver_aad, &chunks).unwrap();
    assert_eq!(opened, payload.to_vec());
}

#[test]
fn test_group_key_distribution() {
    let creator = KeyPair::generate();
    let member = KeyPair::generate();
    let group = KeyPair::generate();

    let wrapped = crypto::wrap_key(
        &crypto::shared_secret(creator.private_key(), member.public_key()).unwrap(),
        group.private_key(),
    )
    .unwrap();
    let unwrapped = crypto::unwrap_key(
        &crypto::shared_secret(member.private_key(), creator.public_key()).unwrap(),
        &wrapped,
    )
    .unwrap();
    assert_eq!(unwrapped, group.private_key().to_vec());

    // group messages are sealed with dh(group, sender) on both sides
    let sender_secret = crypto::shared_secret(group.private_key(), creator.public_key()).unwrap();
    let reader_secret = crypto::shared_secret(&unwrapped, creator.public_key()).unwrap();
    assert_eq!(sender_secret, reader_secret);
}

#[test]
fn test_wrong_receiver_cannot_open() {
    let sender = KeyPair::generate();
    let receiver = KeyPair::generate();
    let intruder = KeyPair::generate();
    let aad = AadContext {
        to: "ureceiver",
        from: "usender",
        sender_key_id: 1,
        receiver_key_id: 2,
        spec_version: 2,
        content_type: 0,
    };
    let secret = crypto::shared_secret(sender.private_key(), receiver.public_key()).unwrap();
    let chunks = crypto::seal_message(&secret, &aad, b"secret").unwrap();

    let wrong = crypto::shared_secret(intruder.private_key(), sender.public_key()).unwrap();
    assert!(matches!(
        crypto::open_message(&wrong, &aad, &chunks),
        Err(ProtocolError::Decryption(_))
    ));
}
