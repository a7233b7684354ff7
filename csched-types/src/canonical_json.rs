//! Deterministic JSON encoding used for hashing: sorted object keys, no
//! insignificant whitespace. `serde_json::Value`'s `Map` is a `BTreeMap` by
//! default (the `preserve_order` feature is not enabled anywhere in this
//! workspace), so round-tripping through `Value` already sorts keys; we only
//! need to make sure we serialize without pretty-printing.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` into canonical JSON bytes: sorted keys, compact form.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let as_value = serde_json::to_value(value)?;
    serde_json::to_vec(&as_value)
}

/// Same as [`canonical_json_bytes`] but returns a `String`.
pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_json_bytes(value)?;
    Ok(String::from_utf8(bytes).expect("serde_json always emits valid utf-8"))
}

/// Lower-case hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_form() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            canonical_json_string(&a).unwrap(),
            canonical_json_string(&b).unwrap()
        );
    }

    #[test]
    fn canonical_form_has_no_insignificant_whitespace() {
        let v = json!({"a": [1, 2, 3]});
        let s = canonical_json_string(&v).unwrap();
        assert!(!s.contains(' '));
    }

    #[test]
    fn hash_is_stable_across_reserialization() {
        let a = json!({"x": 1, "y": {"z": [3, 2, 1]}});
        let h1 = sha256_hex(&canonical_json_bytes(&a).unwrap());
        let reparsed: serde_json::Value =
            serde_json::from_str(&canonical_json_string(&a).unwrap()).unwrap();
        let h2 = sha256_hex(&canonical_json_bytes(&reparsed).unwrap());
        assert_eq!(h1, h2);
    }
}
