//! Canonical cache / dedup keys
//!
//! A key is the SHA256 of `tool_name`, a NUL separator, and the canonical
//! JSON form of the arguments:
//! - object keys sorted lexicographically (recursively)
//! - integral floats collapsed to integers (`1.0` == `1`), `-0.0` == `0`
//! - other floats rendered in shortest round-trip form
//! - strings, booleans, nulls and array order preserved as-is

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;

/// Largest magnitude at which every integer is exactly representable in f64.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// Rewrite a JSON value into its canonical form.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64_INT => {
            Number::from(f as i64)
        }
        Some(f) => Number::from_f64(f).unwrap_or_else(|| n.clone()),
        None => n.clone(),
    }
}

/// Canonical string form of the arguments (useful for logs and debugging).
pub fn canonical_json(arguments: &Value) -> String {
    canonicalize(arguments).to_string()
}

/// Compute the cache / dedup key for a tool invocation.
/// Streams the canonical JSON directly into the hasher.
pub fn cache_key(tool_name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);

    let canonical = canonicalize(arguments);
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &canonical).is_err() {
        // Fall back to Display output, which is infallible
        hasher.update(canonical.to_string().as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Key for non-tool data (e.g. query embeddings) stored in the cache.
pub fn text_key(namespace: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = json!({"symbol": "AAPL", "range": {"to": 2, "from": 1}});
        let b = json!({"range": {"from": 1, "to": 2}, "symbol": "AAPL"});
        assert_eq!(cache_key("get_stock_quote", &a), cache_key("get_stock_quote", &b));
    }

    #[test]
    fn test_key_normalizes_integral_floats() {
        let a = json!({"limit": 10.0});
        let b = json!({"limit": 10});
        assert_eq!(cache_key("screener", &a), cache_key("screener", &b));
        assert_eq!(canonical_json(&json!({"x": -0.0})), r#"{"x":0}"#);
    }

    #[test]
    fn test_key_distinguishes_tool_and_values() {
        let args = json!({"symbol": "AAPL"});
        assert_ne!(cache_key("get_stock_quote", &args), cache_key("news", &args));
        assert_ne!(
            cache_key("get_stock_quote", &args),
            cache_key("get_stock_quote", &json!({"symbol": "aapl"}))
        );
        assert_ne!(
            cache_key("screener", &json!({"ratio": 0.5})),
            cache_key("screener", &json!({"ratio": 0.25}))
        );
    }

    #[test]
    fn test_array_order_is_significant() {
        assert_ne!(
            cache_key("t", &json!({"s": ["A", "B"]})),
            cache_key("t", &json!({"s": ["B", "A"]}))
        );
    }
}
