//! Unknown-field preservation. Every entity keeps a `misc` bag of JSON
//! fields the server sent that this crate doesn't model explicitly, so that
//! future server additions don't silently vanish on archive.

use serde_json::{Map, Value};

pub type Misc = Map<String, Value>;

/// Removes entries that carry no information: `null`, empty string, empty
/// object. Applied after an entity is built from a server payload.
pub fn clean_misc(misc: &mut Misc) {
    misc.retain(|_, v| !is_empty_value(v));
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// Pulls a field out of a raw JSON object into a typed value, leaving
/// whatever remains in `raw` to be absorbed into the misc bag by the caller.
pub fn take<T: serde::de::DeserializeOwned>(raw: &mut Map<String, Value>, key: &str) -> Option<T> {
    raw.remove(key).and_then(|v| serde_json::from_value(v).ok())
}

/// Like [`take`], but only keeps the value if it differs from `baseline`
/// (used throughout the entity model to collapse redundant timestamps:
/// `updateTime` is only recorded if it differs from `createTime`, etc).
pub fn take_if_ne<T: serde::de::DeserializeOwned + PartialEq>(
    raw: &mut Map<String, Value>,
    key: &str,
    baseline: &T,
) -> Option<T> {
    take(raw, key).filter(|v| v != baseline)
}

/// Drops a key from a raw payload entirely; used for fields the archive
/// intentionally never records (redundant, deprecated, or reconstructable).
pub fn drop_key(raw: &mut Map<String, Value>, key: &str) {
    raw.remove(key);
}
