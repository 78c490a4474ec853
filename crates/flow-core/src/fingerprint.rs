//! Structural cache keys for node outputs.
//!
//! A node's fingerprint is a SHA-256 digest of its kind name, version and a
//! canonical rendering of its resolved inputs. Inputs that reference another
//! node contribute that node's fingerprint rather than its value, so the key
//! stays cheap to compute even when upstream outputs are large blobs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::value::Value;

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a single resolved input contributes to the fingerprint.
#[derive(Debug, Clone)]
pub enum InputDigest<'a> {
    /// A literal binding, rendered canonically.
    Literal(&'a Value),
    /// A node-reference binding, represented by the referent's fingerprint.
    Upstream(&'a Fingerprint),
}

/// Fingerprint of a processor node from its identity and resolved inputs.
///
/// Inputs are keyed by parameter name; `BTreeMap` ordering makes the digest
/// independent of the order bindings were declared in.
pub fn processor_fingerprint(
    name: &str,
    version: &str,
    inputs: &BTreeMap<String, InputDigest<'_>>,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    for (param, digest) in inputs {
        hasher.update(param.as_bytes());
        hasher.update(b"=");
        match digest {
            InputDigest::Literal(value) => {
                hasher.update(b"val:");
                let mut rendered = String::new();
                write_canonical(value, &mut rendered);
                hasher.update(rendered.as_bytes());
            }
            InputDigest::Upstream(fp) => {
                hasher.update(b"ref:");
                hasher.update(fp.as_str().as_bytes());
            }
        }
        hasher.update([0u8]);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Fingerprint of a constant node: its name plus a content hash of the
/// held value.
pub fn constant_fingerprint(name: &str, value: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(b"const:");
    let mut rendered = String::new();
    write_canonical(value, &mut rendered);
    hasher.update(rendered.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Canonical textual rendering of a value.
///
/// Object keys are emitted in sorted order, array elements in sequence
/// order. The rendering only feeds the hasher; it is not a serialization
/// format and never needs to be parsed back.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // `{}` on f64 is shortest-roundtrip, so equal floats render
            // identically across runs and platforms.
            out.push_str(&format!("{}", n));
        }
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Bytes(bytes) => {
            out.push_str("0x");
            out.push_str(&hex::encode(bytes));
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
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Json(json) => {
            out.push_str("json:");
            write_canonical_json(json, out);
        }
    }
}

fn write_canonical_json(json: &serde_json::Value, out: &mut String) {
    match json {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            // Sort keys explicitly; the map's iteration order depends on
            // serde_json features.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                write_canonical_json(&map[key], out);
            }
            out.push('}');
        }
    }
}
