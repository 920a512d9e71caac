use std::cmp::Ordering;
use std::fmt::Debug;

use hmac::{Hmac, Mac};
use md5::Md5;
use reqwest::Method;
use serde_json::{Map, Value};

use crate::errors::{SyncError, SyncResult};

type HmacMd5 = Hmac<Md5>;

/// Holds the vendor secret and signs requests with it.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Box<[u8]>,
}

impl Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl RequestSigner {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes().into_boxed_slice(),
        }
    }

    /// Signs `params` for `method` at `timestamp` (epoch milliseconds as a decimal string).
    pub fn sign(&self, params: &Map<String, Value>, method: &Method, timestamp: &str) -> SyncResult<String> {
        let message = string_to_sign(params, method, timestamp)?;
        let mut mac = HmacMd5::new_from_slice(&self.secret)
            .map_err(|e| SyncError::Config(format!("invalid signing key: {e}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Stateless form of [`RequestSigner::sign`].
pub fn sign(secret_key: &str, params: &Map<String, Value>, method: &Method, timestamp: &str) -> SyncResult<String> {
    RequestSigner::new(secret_key).sign(params, method, timestamp)
}

/// Builds the exact string that is hashed.
///
/// POST signs the compact, ASCII-escaped JSON of the canonical parameters.
/// Every other method signs `k=v` pairs joined by `&` in key order. Both forms
/// end with the timestamp.
pub fn string_to_sign(params: &Map<String, Value>, method: &Method, timestamp: &str) -> SyncResult<String> {
    let canonical = canonicalize_map(params)?;

    let mut message = if *method == Method::POST {
        ascii_json(&Value::Object(canonical))?
    } else {
        let mut pairs = Vec::with_capacity(canonical.len());
        for (key, value) in &canonical {
            pairs.push(format!("{}={}", key, query_scalar(key, value)?));
        }
        pairs.join("&")
    };
    message.push_str(timestamp);
    Ok(message)
}

/// Recursively sorts object keys and array elements.
///
/// Arrays of two or more elements must hold scalars of a single kind (numbers,
/// strings or booleans); anything else has no stable order and is rejected.
/// Shorter arrays only have their elements canonicalized.
pub fn canonicalize(value: &Value) -> SyncResult<Value> {
    match value {
        Value::Object(map) => Ok(Value::Object(canonicalize_map(map)?)),
        Value::Array(items) => {
            let mut sorted = items.iter().map(canonicalize).collect::<SyncResult<Vec<_>>>()?;
            if sorted.len() < 2 {
                return Ok(Value::Array(sorted));
            }
            let mut failure = None;
            sorted.sort_by(|a, b| match compare_scalars(a, b) {
                Some(order) => order,
                None => {
                    failure.get_or_insert_with(|| format!("cannot order array elements {a} and {b}"));
                    Ordering::Equal
                }
            });
            if let Some(reason) = failure {
                return Err(SyncError::Encoding(reason));
            }
            if let Some(bad) = sorted.iter().find(|v| v.is_array() || v.is_object()) {
                return Err(SyncError::Encoding(format!("nested collection inside array: {bad}")));
            }
            Ok(Value::Array(sorted))
        }
        scalar => Ok(scalar.clone()),
    }
}

fn canonicalize_map(map: &Map<String, Value>) -> SyncResult<Map<String, Value>> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Map::new();
    for (key, value) in entries {
        out.insert(key.clone(), canonicalize(value)?);
    }
    Ok(out)
}

fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn query_scalar(key: &str, value: &Value) -> SyncResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => Err(SyncError::Encoding(format!(
            "parameter {key} has no query-string form: {value}"
        ))),
    }
}

/// Compact JSON with every non-ASCII character written as a lowercase `\uXXXX` escape.
fn ascii_json(value: &Value) -> SyncResult<String> {
    let compact = serde_json::to_string(value)?;
    let mut out = String::with_capacity(compact.len());
    let mut units = [0u16; 2];
    for ch in compact.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}
