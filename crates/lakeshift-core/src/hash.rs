use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Serialize a JSON value with sorted keys so equal content hashes equally.
pub fn canonical_serialize(value: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (n, (key, inner)) in entries.into_iter().enumerate() {
                if n > 0 {
                    out.push(b',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(inner, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (n, item) in items.iter().enumerate() {
                if n > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => {
            let text = serde_json::to_string(scalar).unwrap_or_default();
            out.extend_from_slice(text.as_bytes());
        }
    }
}

/// SHA-256 of the canonical JSON form of `value`, as lowercase hex.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_serialize(&value));
    Ok(to_hex(&hasher.finalize()))
}

/// Hash a ledger row's fields together with the previous row's hash.
pub fn chain_hash(fields: &[&str], prev_hash: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_serialize_sorts_keys() {
        let value = json!({"z": 1, "a": 2, "m": 3});
        let serialized = String::from_utf8(canonical_serialize(&value)).unwrap();
        assert_eq!(serialized, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_canonical_serialize_escapes_keys() {
        let value = json!({"we\"ird": true});
        let serialized = String::from_utf8(canonical_serialize(&value)).unwrap();
        assert_eq!(serialized, r#"{"we\"ird":true}"#);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"schema": "dbo", "name": "orders"});
        let b = json!({"name": "orders", "schema": "dbo"});
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_chain_hash_depends_on_previous() {
        let first = chain_hash(&["e1", "manual"], None);
        let second = chain_hash(&["e1", "manual"], Some(&first));
        assert_ne!(first, second);
        assert_eq!(first, chain_hash(&["e1", "manual"], None));
    }
}
