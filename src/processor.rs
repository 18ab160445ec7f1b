//! Message parsing and the cache mutation each message implies.
//!
//! Extraction is pure: it never touches the queue or the cache. The worker
//! hands the resulting [`WorkItem`] the current cache value under lock and
//! writes back whatever [`WorkItem::next_entry`] returns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::MessageError;

/// Idempotency key derived from message content.
///
/// Identifies both the cache entry and the unit of mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalKey(String);

impl LogicalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the distributed lock guarding this key.
    pub fn lock_resource(&self) -> String {
        format!("{}.lock", self.0)
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a message asks the worker to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub key: LogicalKey,
    pub payload: serde_json::Value,
    /// Hex SHA-256 of the payload's JSON encoding.
    pub digest: String,
}

impl WorkItem {
    pub fn new(key: LogicalKey, payload: serde_json::Value) -> Self {
        let digest = payload_digest(&payload);
        Self {
            key,
            payload,
            digest,
        }
    }

    /// Computes the entry to write given the value currently cached.
    ///
    /// Returns `None` when the cached entry already reflects this payload, so
    /// a redelivered message commits without writing again.
    pub fn next_entry(&self, current: Option<&str>) -> Option<CacheEntry> {
        let previous = current.and_then(|raw| match serde_json::from_str::<CacheEntry>(raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Overwriting undecodable cache entry");
                None
            }
        });

        if previous.as_ref().is_some_and(|p| p.digest == self.digest) {
            return None;
        }

        Some(CacheEntry {
            payload: self.payload.clone(),
            digest: self.digest.clone(),
            revision: previous.map_or(1, |p| p.revision + 1),
            updated_at: Utc::now(),
        })
    }
}

/// Value stored under a logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub digest: String,
    /// Number of distinct payloads committed for this key.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Turns a raw message body into a work item.
pub trait MessageProcessor: Send + Sync {
    /// # Errors
    ///
    /// Returns `MessageError` for bodies that can never be processed. Such
    /// messages are dropped, not retried.
    fn extract(&self, body: &[u8]) -> Result<WorkItem, MessageError>;
}

/// Reads a JSON object, taking the logical key from one field and keeping the
/// rest as payload.
#[derive(Debug, Clone)]
pub struct JsonMessageProcessor {
    key_field: String,
}

impl Default for JsonMessageProcessor {
    fn default() -> Self {
        Self::new("sm_seq")
    }
}

impl JsonMessageProcessor {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }
}

impl MessageProcessor for JsonMessageProcessor {
    fn extract(&self, body: &[u8]) -> Result<WorkItem, MessageError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(MessageError::EmptyBody);
        }

        let value: serde_json::Value = serde_json::from_slice(body)?;
        let serde_json::Value::Object(mut fields) = value else {
            return Err(MessageError::NotAnObject);
        };

        let key = match fields.remove(&self.key_field) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(MessageError::MissingKey(self.key_field.clone())),
        };

        Ok(WorkItem::new(
            LogicalKey::new(key),
            serde_json::Value::Object(fields),
        ))
    }
}

fn payload_digest(payload: &serde_json::Value) -> String {
    // serde_json's default map is ordered by key, so equal payloads encode
    // identically regardless of field order on the wire.
    let encoded = payload.to_string();
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> JsonMessageProcessor {
        JsonMessageProcessor::default()
    }

    #[test]
    fn test_extract_key_and_payload() {
        let item = processor()
            .extract(br#"{"sm_seq": "order-42", "status": "paid", "amount": 10}"#)
            .expect("valid message");

        assert_eq!(item.key, LogicalKey::new("order-42"));
        assert_eq!(item.key.lock_resource(), "order-42.lock");
        assert_eq!(item.payload["status"], "paid");
        assert!(item.payload.get("sm_seq").is_none());
        assert_eq!(item.digest.len(), 64);
    }

    #[test]
    fn test_numeric_key() {
        let item = processor()
            .extract(br#"{"sm_seq": 42}"#)
            .expect("numeric key");
        assert_eq!(item.key.as_str(), "42");
    }

    #[test]
    fn test_custom_key_field() {
        let item = JsonMessageProcessor::new("order_id")
            .extract(br#"{"order_id": "o-1"}"#)
            .expect("valid");
        assert_eq!(item.key.as_str(), "o-1");
    }

    #[test]
    fn test_malformed_messages() {
        let p = processor();
        assert!(matches!(p.extract(b""), Err(MessageError::EmptyBody)));
        assert!(matches!(p.extract(b"  \n"), Err(MessageError::EmptyBody)));
        assert!(matches!(p.extract(b"not json"), Err(MessageError::InvalidJson(_))));
        assert!(matches!(p.extract(b"[1, 2]"), Err(MessageError::NotAnObject)));
        assert!(matches!(
            p.extract(br#"{"other": 1}"#),
            Err(MessageError::MissingKey(_))
        ));
        assert!(matches!(
            p.extract(br#"{"sm_seq": ""}"#),
            Err(MessageError::MissingKey(_))
        ));
        assert!(matches!(
            p.extract(br#"{"sm_seq": null}"#),
            Err(MessageError::MissingKey(_))
        ));
    }

    #[test]
    fn test_digest_ignores_field_order() {
        let a = processor()
            .extract(br#"{"sm_seq": "k", "a": 1, "b": 2}"#)
            .expect("valid");
        let b = processor()
            .extract(br#"{"b": 2, "sm_seq": "k", "a": 1}"#)
            .expect("valid");
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_first_write_starts_at_revision_one() {
        let item = WorkItem::new(LogicalKey::new("k"), serde_json::json!({"v": 1}));
        let entry = item.next_entry(None).expect("write needed");
        assert_eq!(entry.revision, 1);
        assert_eq!(entry.payload, serde_json::json!({"v": 1}));
    }

    #[test]
    fn test_same_payload_needs_no_write() {
        let item = WorkItem::new(LogicalKey::new("k"), serde_json::json!({"v": 1}));
        let stored = item.next_entry(None).expect("write").to_json().expect("encode");
        assert!(item.next_entry(Some(&stored)).is_none());
    }

    #[test]
    fn test_new_payload_bumps_revision() {
        let first = WorkItem::new(LogicalKey::new("k"), serde_json::json!({"v": 1}));
        let stored = first.next_entry(None).expect("write").to_json().expect("encode");

        let second = WorkItem::new(LogicalKey::new("k"), serde_json::json!({"v": 2}));
        let entry = second.next_entry(Some(&stored)).expect("write");
        assert_eq!(entry.revision, 2);
    }

    #[test]
    fn test_garbage_entry_is_overwritten() {
        let item = WorkItem::new(LogicalKey::new("k"), serde_json::json!({"v": 1}));
        let entry = item.next_entry(Some("1700000000")).expect("write");
        assert_eq!(entry.revision, 1);
    }
}
