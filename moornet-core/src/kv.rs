//! Key/value persistence capability.
//!
//! Scope definitions are written through to an external key/value store so they
//! survive a restart of the control plane. The store itself is an external
//! collaborator; the context only needs the small surface below. `MemoryKv` is
//! the in-process reference implementation used by tests.

use crate::error::{NetworkError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key/value store capability.
///
/// `get` and `delete` report a missing key as [`NetworkError::KeyNotFound`] so
/// callers can tolerate it structurally.
pub trait KvStore: Send + Sync {
    /// Store a value under a key, overwriting any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under a key.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// List all entries whose key matches the given regular expression.
    fn list(&self, pattern: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Delete the value stored under a key.
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory key/value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).cloned().ok_or_else(|| NetworkError::KeyNotFound { key: key.to_string() })
    }

    fn list(&self, pattern: &str) -> Result<HashMap<String, Vec<u8>>> {
        let re = Regex::new(pattern).map_err(NetworkError::internal)?;
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().filter(|(k, _)| re.is_match(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| NetworkError::KeyNotFound { key: key.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = MemoryKv::new();
        kv.put("a", b"1").unwrap();
        assert_eq!(kv.get("a").unwrap(), b"1");

        kv.put("a", b"2").unwrap();
        assert_eq!(kv.get("a").unwrap(), b"2");

        kv.delete("a").unwrap();
        assert!(kv.get("a").unwrap_err().is_key_not_found());
        assert!(kv.delete("a").unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_list_pattern() {
        let kv = MemoryKv::new();
        kv.put("context.scopes.net1", b"1").unwrap();
        kv.put("context.scopes.net2", b"2").unwrap();
        kv.put("context.other", b"3").unwrap();

        let entries = kv.list(r"context\.scopes\..+").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("context.scopes.net1"));
        assert!(entries.contains_key("context.scopes.net2"));
    }

    #[test]
    fn test_list_invalid_pattern() {
        let kv = MemoryKv::new();
        assert!(kv.list("(").is_err());
    }
}
