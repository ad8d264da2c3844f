//! Tests for the value model, identifiers, and the round-trip law.

use std::collections::BTreeMap;

use crate::GroupIdentifier;
use crate::Identifier;
use crate::KeyIdentifier;
use crate::PostIdentifier;
use crate::PostIvIdentifier;
use crate::ProfileIdentifier;
use crate::SerializationError;
use crate::Value;
use crate::WireValue;
use crate::deserialize;
use crate::serialize;

fn roundtrip(value: Value) {
    let wire = serialize(&value).unwrap();
    let back = deserialize(&wire).unwrap();
    assert_eq!(back, value);
}

#[test]
fn roundtrip_primitives() {
    roundtrip(Value::Null);
    roundtrip(Value::Bool(true));
    roundtrip(Value::Bool(false));
    roundtrip(Value::Int(0));
    roundtrip(Value::Int(-42));
    roundtrip(Value::Int(i64::MAX));
    roundtrip(Value::Float(1.5));
    roundtrip(Value::Text(String::new()));
    roundtrip(Value::text("hello"));
    roundtrip(Value::text("emoji ✨ and \"quotes\""));
}

#[test]
fn roundtrip_bytes() {
    roundtrip(Value::Bytes(vec![]));
    roundtrip(Value::Bytes(vec![0x00, 0x01, 0xfe, 0xff]));
    roundtrip(Value::Bytes((0..=255).collect()));
}

#[test]
fn roundtrip_containers() {
    roundtrip(Value::List(vec![]));
    roundtrip(Value::List(vec![
        Value::Int(1),
        Value::text("two"),
        Value::List(vec![Value::Null]),
    ]));

    let mut map = BTreeMap::new();
    map.insert("a".to_string(), Value::Int(1));
    map.insert("nested".to_string(), Value::List(vec![Value::Bool(true)]));
    roundtrip(Value::Map(map));
}

#[test]
fn roundtrip_identifiers() {
    let profile = ProfileIdentifier::new("example.com", "alice");
    roundtrip(Value::Id(Identifier::Profile(profile.clone())));
    roundtrip(Value::Id(Identifier::Group(GroupIdentifier::new(
        "example.com",
        "friends",
    ))));
    roundtrip(Value::Id(Identifier::Post(PostIdentifier::new(
        profile, "p0st_1",
    ))));
    roundtrip(Value::Id(Identifier::PostIv(PostIvIdentifier::new(
        "example.com",
        "AAv3/x8=",
    ))));
    roundtrip(Value::Id(Identifier::Key(KeyIdentifier::new(
        "secp256k1",
        "BASE64+WITH/SLASH=",
    ))));
}

#[test]
fn identifier_text_is_exact_inverse() {
    let id = Identifier::Post(PostIdentifier::new(
        ProfileIdentifier::new("example.com", "bob"),
        "id/with/slashes",
    ));
    let text = id.to_text();
    assert_eq!(text, "post:example.com/bob/id/with/slashes");
    assert_eq!(Identifier::from_text(&text).unwrap(), id);
}

#[test]
fn identifier_equality_is_by_value() {
    let a = Identifier::Profile(ProfileIdentifier::new("net", "user"));
    let b = Identifier::from_text("profile:net/user").unwrap();
    assert_eq!(a, b);
}

#[test]
fn malformed_identifier_text_fails() {
    for text in ["", "profile", "profile:no-slash", "person:net/user"] {
        let err = Identifier::from_text(text).unwrap_err();
        assert!(matches!(err, SerializationError::BadIdentifier(_)), "{:?}", text);
    }
}

#[test]
fn map_with_reserved_key_roundtrips() {
    let mut map = BTreeMap::new();
    map.insert("$type".to_string(), Value::text("user data, not a tag"));
    map.insert("other".to_string(), Value::Int(7));
    let value = Value::Map(map);

    let wire = serialize(&value).unwrap();
    // Must have been escaped into a tagged map.
    let WireValue::Map(entries) = &wire else {
        panic!("expected map, got {:?}", wire);
    };
    assert_eq!(
        entries.get("$type"),
        Some(&WireValue::Text("map".to_string()))
    );

    assert_eq!(deserialize(&wire).unwrap(), value);
}

#[test]
fn unknown_tag_fails_to_decode() {
    let mut entries = BTreeMap::new();
    entries.insert(
        "$type".to_string(),
        WireValue::Text("blob-v2".to_string()),
    );
    let err = deserialize(&WireValue::Map(entries)).unwrap_err();
    assert_eq!(err, SerializationError::UnknownTag("blob-v2".to_string()));
}

#[test]
fn bad_hex_fails_to_decode() {
    let mut entries = BTreeMap::new();
    entries.insert("$type".to_string(), WireValue::Text("bytes".to_string()));
    entries.insert("data".to_string(), WireValue::Text("abc".to_string()));
    let err = deserialize(&WireValue::Map(entries)).unwrap_err();
    assert!(matches!(err, SerializationError::BadHex(_)));

    let mut entries = BTreeMap::new();
    entries.insert("$type".to_string(), WireValue::Text("bytes".to_string()));
    entries.insert("data".to_string(), WireValue::Text("zz".to_string()));
    assert!(deserialize(&WireValue::Map(entries)).is_err());
}

#[test]
fn tagged_map_missing_field_fails() {
    let mut entries = BTreeMap::new();
    entries.insert("$type".to_string(), WireValue::Text("id".to_string()));
    let err = deserialize(&WireValue::Map(entries)).unwrap_err();
    assert_eq!(err, SerializationError::MissingField("value"));
}

#[test]
fn display_renders_compact_literals() {
    assert_eq!(Value::Null.to_string(), "null");
    assert_eq!(Value::text("hi").to_string(), "\"hi\"");
    assert_eq!(Value::Bytes(vec![1, 2, 3]).to_string(), "<3 bytes>");
    assert_eq!(
        Value::List(vec![Value::Int(1), Value::Bool(false)]).to_string(),
        "[1, false]"
    );
    assert_eq!(
        Value::Id(Identifier::Profile(ProfileIdentifier::new("n", "u"))).to_string(),
        "profile:n/u"
    );
}
