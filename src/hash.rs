//! Canonical serialization and SHA-256 hashing of payload bodies and
//! state snapshots.
//!
//! Every hash in the system is computed over the same deterministic byte
//! encoding: mappings are recursively sorted by key, sequences keep their
//! order, scalars use serde_json's textual form, and the whole encoding
//! is compact UTF-8 JSON. Two runs that produce the same value therefore
//! produce the same digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encode a JSON value into its canonical textual form.
///
/// Object keys are sorted at every nesting level; separators are compact
/// (`,` and `:`), matching no particular pretty-printer on purpose: the
/// encoding only has to agree with itself.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => {
            out.push_str(&value.to_string());
        }
        Value::String(s) => {
            // serde_json handles escaping; a bare string is valid JSON.
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of the canonical encoding, as lowercase hex.
pub fn hash_value(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

/// SHA-256 of raw bytes, as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a single `{key: value}` entry of a snapshot.
///
/// Used to derive Merkle leaves: each top-level entry of an object
/// snapshot becomes one leaf so that individual entries can later be
/// proven against the root without re-hashing the whole snapshot.
pub fn hash_entry(key: &str, value: &Value) -> String {
    let entry = Value::Object(
        [(key.to_string(), value.clone())]
            .into_iter()
            .collect::<serde_json::Map<String, Value>>(),
    );
    hash_value(&entry)
}

/// Split a snapshot into its ordered Merkle leaf hashes.
///
/// Objects yield one leaf per key (sorted); arrays one leaf per element;
/// anything else a single leaf over the whole value. The result is never
/// empty: an empty object or array collapses to the single-leaf case.
pub fn snapshot_leaves(snapshot: &Value) -> Vec<String> {
    match snapshot {
        Value::Object(map) if !map.is_empty() => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.into_iter().map(|k| hash_entry(k, &map[k])).collect()
        }
        Value::Array(items) if !items.is_empty() => items.iter().map(hash_value).collect(),
        other => vec![hash_value(other)],
    }
}
