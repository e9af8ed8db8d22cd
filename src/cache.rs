//! Time-expiring response cache keyed by a hash of the call signature.
//!
//! Expired entries read as absent but stay in storage until `clear`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::storage::Storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Milliseconds since the Unix epoch.
    pub written_at: i64,
    pub value: Value,
}

/// Deterministic key over the endpoint name and its arguments.
pub fn cache_key(endpoint: &str, args: &[&str]) -> String {
    let signature = json!([endpoint, args]).to_string();
    blake3::hash(signature.as_bytes()).to_hex().to_string()
}

fn storage_key(key: &str) -> String {
    format!("{key}.json")
}

pub struct ResponseCache {
    storage: Arc<dyn Storage>,
    expiry: Duration,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(storage: Arc<dyn Storage>, expiry: Duration, enabled: bool) -> Self {
        Self {
            storage,
            expiry,
            enabled,
        }
    }

    pub fn disabled(storage: Arc<dyn Storage>) -> Self {
        Self::new(storage, Duration::ZERO, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let raw = match self.storage.get(&storage_key(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(key, error = %err, "ignoring malformed cache entry");
                return None;
            }
        };
        let age_ms = now.timestamp_millis() - entry.written_at;
        let expiry_ms = i64::try_from(self.expiry.as_millis()).unwrap_or(i64::MAX);
        if age_ms < expiry_ms {
            debug!(key, age_ms, "cache hit");
            Some(entry.value)
        } else {
            debug!(key, age_ms, "cache entry expired");
            None
        }
    }

    /// Returns whether the entry was written. Failures are logged, never
    /// propagated.
    pub fn set(&self, key: &str, value: &Value) -> bool {
        self.set_at(key, value, Utc::now())
    }

    pub fn set_at(&self, key: &str, value: &Value, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            written_at: now.timestamp_millis(),
            value: value.clone(),
        };
        let payload = match serde_json::to_vec(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "cache entry not serializable");
                return false;
            }
        };
        match self.storage.set(&storage_key(key), &payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(key, error = %err, "cache write failed");
                false
            }
        }
    }

    /// Deletes every entry, expired or not. Works even when the cache is
    /// disabled so stale files can still be purged.
    pub fn clear(&self) -> std::io::Result<usize> {
        self.storage.clear()
    }
}
