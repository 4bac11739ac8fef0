//! Canonical msgpack payloads shared with the wider LXMF ecosystem.
//!
//! Announce app-data is a packed three-element sequence: display-name bytes
//! (empty when unset), an optional stamp cost, and an optional avatar
//! metadata map keyed by the byte strings `h`, `t`, `s`, `u`. Peers decode
//! this byte-for-byte, so the encoder never deviates from that shape.

use rmpv::Value;

/// Avatar metadata as carried in announces and profile responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvatarAnnounce {
    /// Leading 16 bytes of the SHA-256 of the avatar bytes.
    pub fingerprint: Vec<u8>,
    pub mime: String,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Clone, Debug, Default)]
pub struct AnnounceAppData {
    pub display_name: Option<String>,
    pub stamp_cost: Option<u8>,
    pub avatar: Option<AvatarAnnounce>,
}

pub fn encode_announce_app_data(
    display_name: &str,
    stamp_cost: Option<u8>,
    avatar: Option<&AvatarAnnounce>,
) -> Vec<u8> {
    let name = Value::Binary(display_name.as_bytes().to_vec());
    let cost = match stamp_cost {
        Some(cost) if cost > 0 && cost < 255 => Value::from(cost),
        _ => Value::Nil,
    };
    let avatar = avatar.map(avatar_map).unwrap_or(Value::Nil);
    encode_value(&Value::Array(vec![name, cost, avatar]))
}

fn avatar_map(avatar: &AvatarAnnounce) -> Value {
    Value::Map(vec![
        (Value::Binary(b"h".to_vec()), Value::Binary(avatar.fingerprint.clone())),
        (Value::Binary(b"t".to_vec()), Value::String(avatar.mime.as_str().into())),
        (Value::Binary(b"s".to_vec()), Value::from(avatar.size)),
        (Value::Binary(b"u".to_vec()), Value::from(avatar.mtime)),
    ])
}

pub fn decode_announce_app_data(data: &[u8]) -> Option<AnnounceAppData> {
    let decoded: Vec<Value> = rmp_serde::from_slice(data).ok()?;
    if decoded.is_empty() {
        return None;
    }
    let display_name = value_to_string(decoded.first()?).filter(|name| !name.is_empty());
    let stamp_cost = decoded.get(1).and_then(value_to_u64).and_then(|cost| {
        if cost > 0 && cost < 255 {
            u8::try_from(cost).ok()
        } else {
            None
        }
    });
    let avatar = decoded.get(2).and_then(decode_avatar_map);
    Some(AnnounceAppData { display_name, stamp_cost, avatar })
}

pub fn decode_avatar_map(value: &Value) -> Option<AvatarAnnounce> {
    let Value::Map(entries) = value else {
        return None;
    };
    let fingerprint = map_entry_bytes(entries, b"h")?;
    let mime = map_entry(entries, b"t").and_then(value_to_string).unwrap_or_default();
    let size = map_entry(entries, b"s").and_then(value_to_u64).unwrap_or(0);
    let mtime = map_entry(entries, b"u").and_then(value_to_u64).unwrap_or(0);
    Some(AvatarAnnounce { fingerprint, mime, size, mtime })
}

/// Tolerant peer-name extraction: accepts the canonical three-element form
/// as well as legacy announces that carry a bare name string or byte string.
pub fn display_name_from_app_data(data: &[u8]) -> Option<String> {
    if let Some(decoded) = decode_announce_app_data(data) {
        return decoded.display_name;
    }
    let value: Value = rmp_serde::from_slice(data).ok()?;
    value_to_string(&value).filter(|name| !name.is_empty())
}

pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    // writing into a Vec cannot fail
    let _ = rmpv::encode::write_value(&mut out, value);
    out
}

pub fn decode_value(data: &[u8]) -> Option<Value> {
    let mut cursor = std::io::Cursor::new(data);
    rmpv::decode::read_value(&mut cursor).ok()
}

/// Builds a response or request map with string keys.
pub fn string_map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(key, value)| (Value::String(key.into()), value)).collect())
}

pub fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    let Value::Map(entries) = map else {
        return None;
    };
    map_entry(entries, key.as_bytes())
}

pub fn map_bool(map: &Value, key: &str) -> Option<bool> {
    map_get(map, key).and_then(Value::as_bool)
}

pub fn map_u64(map: &Value, key: &str) -> Option<u64> {
    map_get(map, key).and_then(value_to_u64)
}

pub fn map_string(map: &Value, key: &str) -> Option<String> {
    map_get(map, key).and_then(value_to_string)
}

pub fn map_bytes(map: &Value, key: &str) -> Option<Vec<u8>> {
    map_get(map, key).and_then(value_to_bytes)
}

/// Map lookup matching byte-string and string keys interchangeably.
fn map_entry<'a>(entries: &'a [(Value, Value)], key: &[u8]) -> Option<&'a Value> {
    entries.iter().find_map(|(entry_key, entry_value)| {
        let matches = match entry_key {
            Value::Binary(bytes) => bytes.as_slice() == key,
            Value::String(text) => text.as_bytes() == key,
            _ => false,
        };
        matches.then_some(entry_value)
    })
}

fn map_entry_bytes(entries: &[(Value, Value)], key: &[u8]) -> Option<Vec<u8>> {
    map_entry(entries, key).and_then(value_to_bytes)
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Binary(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::String(text) => text.as_str().map(|s| s.to_string()),
        _ => None,
    }
}

pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(bytes) => Some(bytes.clone()),
        Value::String(text) => text.as_str().map(|s| s.as_bytes().to_vec()),
        _ => None,
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_i64().and_then(|v| u64::try_from(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_avatar() -> AvatarAnnounce {
        AvatarAnnounce {
            fingerprint: vec![0xAB; 16],
            mime: "image/png".to_string(),
            size: 1024,
            mtime: 1_700_000_000,
        }
    }

    #[test]
    fn app_data_round_trips_all_fields() {
        let avatar = sample_avatar();
        let data = encode_announce_app_data("Alice", Some(12), Some(&avatar));
        let decoded = decode_announce_app_data(&data).expect("decode app data");
        assert_eq!(decoded.display_name.as_deref(), Some("Alice"));
        assert_eq!(decoded.stamp_cost, Some(12));
        assert_eq!(decoded.avatar, Some(avatar));
    }

    #[test]
    fn app_data_wire_shape_is_canonical() {
        let avatar = sample_avatar();
        let data = encode_announce_app_data("Alice", None, Some(&avatar));
        let value = decode_value(&data).expect("read back");
        let Value::Array(items) = value else {
            panic!("announce app-data must be an array, got {value:?}");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::Binary(b"Alice".to_vec()));
        assert_eq!(items[1], Value::Nil);
        let Value::Map(entries) = &items[2] else {
            panic!("avatar element must be a map");
        };
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].0, Value::Binary(b"h".to_vec()));
        assert_eq!(entries[0].1, Value::Binary(vec![0xAB; 16]));
        assert_eq!(entries[1].1, Value::String("image/png".into()));
        assert_eq!(entries[2].1, Value::from(1024_u64));
        assert_eq!(entries[3].1, Value::from(1_700_000_000_u64));
    }

    #[test]
    fn empty_name_encodes_as_empty_bytes() {
        let data = encode_announce_app_data("", None, None);
        let value = decode_value(&data).expect("read back");
        let Value::Array(items) = value else {
            panic!("expected array");
        };
        assert_eq!(items[0], Value::Binary(Vec::new()));
        assert_eq!(items[1], Value::Nil);
        assert_eq!(items[2], Value::Nil);
        let decoded = decode_announce_app_data(&data).expect("decode");
        assert_eq!(decoded.display_name, None);
        assert_eq!(decoded.avatar, None);
    }

    #[test]
    fn out_of_range_stamp_cost_is_suppressed() {
        for cost in [0_u8, 255] {
            let data = encode_announce_app_data("x", Some(cost), None);
            let decoded = decode_announce_app_data(&data).expect("decode");
            assert_eq!(decoded.stamp_cost, None, "cost {cost} must not be announced");
        }
    }

    #[test]
    fn legacy_bare_name_announces_still_decode() {
        let data = encode_value(&Value::String("Bob".into()));
        assert_eq!(display_name_from_app_data(&data).as_deref(), Some("Bob"));
        let data = encode_value(&Value::Binary(b"Carol".to_vec()));
        assert_eq!(display_name_from_app_data(&data).as_deref(), Some("Carol"));
    }

    #[test]
    fn map_helpers_accept_string_and_byte_keys() {
        let map = Value::Map(vec![
            (Value::String("ok".into()), Value::Boolean(true)),
            (Value::Binary(b"h".to_vec()), Value::Binary(vec![1, 2, 3])),
        ]);
        assert_eq!(map_bool(&map, "ok"), Some(true));
        assert_eq!(map_bytes(&map, "h"), Some(vec![1, 2, 3]));
        assert_eq!(map_bool(&map, "missing"), None);
    }
}
