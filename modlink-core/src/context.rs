//! Read view over a received payload: typed accessors plus the raw bytes.
//!
//! Payloads are JSON by convention. A `Context` is built fresh per inbound
//! request/notice and is immutable after construction; accessors never panic,
//! missing or mistyped keys yield `None`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RequestError;

#[derive(Debug, Clone)]
pub struct Context {
    raw: Vec<u8>,
    value: Value,
}

impl Context {
    /// Build a context from raw payload bytes. An empty payload is valid and
    /// yields a null context; bytes that are not JSON are a caller error.
    pub fn from_payload(raw: &[u8]) -> Result<Self, RequestError> {
        let value = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(raw)
                .map_err(|e| RequestError::bad_req(format!("payload is not valid JSON: {e}")))?
        };
        Ok(Self {
            raw: raw.to_vec(),
            value,
        })
    }

    /// The untouched payload bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The parsed payload.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Look up `key` on an object payload: exact match first, then a
    /// case/underscore-insensitive fallback (`devCode` finds `dev_code`).
    pub fn get(&self, key: &str) -> Option<&Value> {
        let map = self.value.as_object()?;
        if let Some(v) = map.get(key) {
            return Some(v);
        }
        let folded = fold_key(key);
        map.iter().find(|(k, _)| fold_key(k) == folded).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    /// Timestamp accessor: epoch milliseconds, as a number or numeric string.
    pub fn get_date(&self, key: &str) -> Option<SystemTime> {
        let millis = self.get_u64(key)?;
        Some(UNIX_EPOCH + Duration::from_millis(millis))
    }

    /// Deserialize the whole payload into a struct.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| RequestError::bad_req(format!("payload bind failed: {e}")))
    }

    /// Deserialize one key of an object payload into a struct.
    pub fn bind_key<T: DeserializeOwned>(&self, key: &str) -> Result<T, RequestError> {
        let value = self
            .get(key)
            .ok_or_else(|| RequestError::bad_req(format!("missing key: {key}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RequestError::bad_req(format!("bind of {key} failed: {e}")))
    }
}

/// Serialize a value into payload bytes (JSON).
pub fn json_payload<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}
