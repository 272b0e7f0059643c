//! Key-value store with per-key expiry, backing all room state.
//!
//! Architecture:
//! ```text
//! ┌────────────┐   typed ops    ┌────────────────┐   raw entries   ┌──────────────┐
//! │ RoomEngine │ ─────────────► │ RoomStore      │ ──────────────► │ KeyValueStore│
//! └────────────┘                │ room/users/    │                 │ TTL + atomic │
//!                               │ ready/chat/lock│                 │ read-modify  │
//!                               └────────────────┘                 └──────┬───────┘
//!                                                                         │ Backend
//!                                                     ┌───────────────────┴──────────┐
//!                                                     ▼                              ▼
//!                                               MemoryBackend                   RocksBackend
//! ```
//!
//! Expiry is lazy: an entry whose deadline has passed reads as absent and is
//! deleted on the next touch. [`KeyValueStore::purge_expired`] reclaims the
//! rest in the background.

pub mod memory;
pub mod rocks;
pub mod room_store;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};
pub use room_store::RoomStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    List(Vec<String>),
    /// Presence-only key
    Flag,
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::List(_) => "list",
            Value::Flag => "flag",
        }
    }
}

/// A value plus its optional expiry deadline (epoch ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend failure (RocksDB, poisoned lock)
    DatabaseError(String),
    /// Operation applied to a key holding another kind of value
    WrongType { key: String, expected: &'static str, found: &'static str },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::WrongType { key, expected, found } => {
                write!(f, "Key {key} holds a {found}, expected a {expected}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Raw persistence of entries. Expiry and atomicity live in [`KeyValueStore`].
pub trait Backend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Entry>, StoreError>;
    fn save(&self, key: &str, entry: &Entry) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Redis-style operations over a [`Backend`].
///
/// Every operation is a read-modify-write under one mutex, so each call is
/// atomic with respect to every other call. Writes to an existing key keep
/// its deadline.
pub struct KeyValueStore {
    backend: Box<dyn Backend>,
    clock: Arc<dyn Clock>,
    guard: Mutex<()>,
}

impl KeyValueStore {
    pub fn new(backend: Box<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            guard: Mutex::new(()),
        }
    }

    /// In-memory store.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Box::new(MemoryBackend::new()), clock)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.guard
            .lock()
            .map_err(|_| StoreError::DatabaseError("store lock poisoned".into()))
    }

    /// Load a live entry, deleting it if its deadline passed.
    fn live(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        match self.backend.load(key)? {
            Some(entry) if entry.is_expired(self.clock.now_ms()) => {
                self.backend.delete(key)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn wrong_type(key: &str, expected: &'static str, found: &Value) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        Ok(self.live(key)?.is_some())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _g = self.lock()?;
        self.backend.delete(key)
    }

    // ─── Hashes ───────────────────────────────────────────────────────

    pub fn hget_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            None => Ok(None),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(Some(fields)),
            Some(entry) => Err(Self::wrong_type(key, "hash", &entry.value)),
        }
    }

    /// Merge `fields` into the hash, creating it if absent.
    pub fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let _g = self.lock()?;
        let mut entry = self
            .live(key)?
            .unwrap_or_else(|| Entry::new(Value::Hash(BTreeMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_string(), value.clone());
                }
            }
            other => return Err(Self::wrong_type(key, "hash", other)),
        }
        self.backend.save(key, &entry)
    }

    // ─── Sets ─────────────────────────────────────────────────────────

    /// Make sure an (possibly empty) set exists at `key`.
    pub fn ensure_set(&self, key: &str) -> Result<(), StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            Some(Entry { value: Value::Set(_), .. }) => Ok(()),
            Some(entry) => Err(Self::wrong_type(key, "set", &entry.value)),
            None => self.backend.save(key, &Entry::new(Value::Set(BTreeSet::new()))),
        }
    }

    /// Returns `true` if the member was newly added.
    pub fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        let mut entry = self
            .live(key)?
            .unwrap_or_else(|| Entry::new(Value::Set(BTreeSet::new())));
        let added = match &mut entry.value {
            Value::Set(set) => set.insert(member.to_string()),
            other => return Err(Self::wrong_type(key, "set", other)),
        };
        self.backend.save(key, &entry)?;
        Ok(added)
    }

    /// Returns `true` if the member was present.
    pub fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        let Some(mut entry) = self.live(key)? else {
            return Ok(false);
        };
        let removed = match &mut entry.value {
            Value::Set(set) => set.remove(member),
            other => return Err(Self::wrong_type(key, "set", other)),
        };
        if removed {
            self.backend.save(key, &entry)?;
        }
        Ok(removed)
    }

    pub fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.into_iter().collect()),
            Some(entry) => Err(Self::wrong_type(key, "set", &entry.value)),
        }
    }

    pub fn scard(&self, key: &str) -> Result<usize, StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            None => Ok(0),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.len()),
            Some(entry) => Err(Self::wrong_type(key, "set", &entry.value)),
        }
    }

    pub fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            None => Ok(false),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(entry) => Err(Self::wrong_type(key, "set", &entry.value)),
        }
    }

    /// Empty the set without touching its deadline.
    pub fn sclear(&self, key: &str) -> Result<(), StoreError> {
        let _g = self.lock()?;
        let mut entry = self
            .live(key)?
            .unwrap_or_else(|| Entry::new(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(set) => set.clear(),
            other => return Err(Self::wrong_type(key, "set", other)),
        }
        self.backend.save(key, &entry)
    }

    // ─── Lists ────────────────────────────────────────────────────────

    /// Make sure an (possibly empty) list exists at `key`.
    pub fn ensure_list(&self, key: &str) -> Result<(), StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            Some(Entry { value: Value::List(_), .. }) => Ok(()),
            Some(entry) => Err(Self::wrong_type(key, "list", &entry.value)),
            None => self.backend.save(key, &Entry::new(Value::List(Vec::new()))),
        }
    }

    /// Append `item`, then keep only the newest `max_len` items.
    /// Returns the resulting length.
    pub fn rpush_capped(&self, key: &str, item: String, max_len: usize) -> Result<usize, StoreError> {
        let _g = self.lock()?;
        let mut entry = self
            .live(key)?
            .unwrap_or_else(|| Entry::new(Value::List(Vec::new())));
        let len = match &mut entry.value {
            Value::List(items) => {
                items.push(item);
                if items.len() > max_len {
                    let excess = items.len() - max_len;
                    items.drain(..excess);
                }
                items.len()
            }
            other => return Err(Self::wrong_type(key, "list", other)),
        };
        self.backend.save(key, &entry)?;
        Ok(len)
    }

    pub fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let _g = self.lock()?;
        match self.live(key)? {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(items), .. }) => Ok(items),
            Some(entry) => Err(Self::wrong_type(key, "list", &entry.value)),
        }
    }

    // ─── Flags & expiry ───────────────────────────────────────────────

    /// Set a presence-only key with a TTL, only if absent.
    /// Returns `true` if this call created it.
    pub fn set_flag_nx(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        if self.live(key)?.is_some() {
            return Ok(false);
        }
        let entry = Entry {
            value: Value::Flag,
            expires_at: Some(self.clock.now_ms() + ttl_ms),
        };
        self.backend.save(key, &entry)?;
        Ok(true)
    }

    /// Arm a deadline `ttl_ms` from now. Returns `false` if the key is absent.
    pub fn expire(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        Ok(self.expire_all(&[key.to_string()], ttl_ms)? == 1)
    }

    /// Arm one shared deadline `ttl_ms` from now on every present key, in a
    /// single atomic step. Returns how many keys were armed.
    pub fn expire_all(&self, keys: &[String], ttl_ms: u64) -> Result<usize, StoreError> {
        let _g = self.lock()?;
        let deadline = self.clock.now_ms() + ttl_ms;
        let mut armed = 0;
        for key in keys {
            if let Some(mut entry) = self.live(key)? {
                entry.expires_at = Some(deadline);
                self.backend.save(key, &entry)?;
                armed += 1;
            }
        }
        Ok(armed)
    }

    /// Clear the deadline. Returns `false` if the key is absent.
    pub fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let _g = self.lock()?;
        let Some(mut entry) = self.live(key)? else {
            return Ok(false);
        };
        if entry.expires_at.take().is_some() {
            self.backend.save(key, &entry)?;
        }
        Ok(true)
    }

    /// Remaining time to live in ms; `None` if absent or persistent.
    pub fn ttl_ms(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let _g = self.lock()?;
        let now = self.clock.now_ms();
        Ok(self
            .live(key)?
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_sub(now)))
    }

    /// Delete every expired entry. Returns how many were reclaimed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let _g = self.lock()?;
        let now = self.clock.now_ms();
        let mut purged = 0;
        for key in self.backend.keys()? {
            if let Some(entry) = self.backend.load(&key)? {
                if entry.is_expired(now) {
                    self.backend.delete(&key)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    /// Live keys starting with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _g = self.lock()?;
        let mut found = Vec::new();
        for key in self.backend.keys()? {
            if key.starts_with(prefix) && self.live(&key)?.is_some() {
                found.push(key);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store() -> (KeyValueStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (KeyValueStore::in_memory(clock.clone()), clock)
    }

    #[test]
    fn test_scan_prefix_skips_expired() {
        let (kv, clock) = store();
        kv.ensure_set("room:a").unwrap();
        kv.ensure_set("room:b").unwrap();
        kv.ensure_set("users:a").unwrap();
        kv.expire("room:b", 10).unwrap();
        clock.advance(Duration::from_millis(10));
        assert_eq!(kv.scan_prefix("room:").unwrap(), vec!["room:a".to_string()]);
    }

    #[test]
    fn test_expire_all_shares_one_deadline() {
        let (kv, clock) = store();
        kv.ensure_set("a").unwrap();
        kv.ensure_list("b").unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        assert_eq!(kv.expire_all(&keys, 500).unwrap(), 2);
        assert_eq!(kv.ttl_ms("a").unwrap(), Some(500));
        assert_eq!(kv.ttl_ms("b").unwrap(), Some(500));
        assert!(!kv.exists("missing").unwrap());

        clock.advance(Duration::from_millis(499));
        assert!(kv.exists("a").unwrap() && kv.exists("b").unwrap());
        clock.advance(Duration::from_millis(1));
        assert!(!kv.exists("a").unwrap());
        assert!(!kv.exists("b").unwrap());
    }

    #[test]
    fn test_hash_merge() {
        let (kv, _) = store();
        kv.hset_multiple("h", &[("a", "1".into()), ("b", "2".into())]).unwrap();
        kv.hset_multiple("h", &[("b", "3".into())]).unwrap();
        let fields = kv.hget_all("h").unwrap().unwrap();
        assert_eq!(fields["a"], "1");
        assert_eq!(fields["b"], "3");
        assert!(kv.hget_all("missing").unwrap().is_none());
    }

    #[test]
    fn test_set_membership() {
        let (kv, _) = store();
        assert!(kv.sadd("s", "alice").unwrap());
        assert!(!kv.sadd("s", "alice").unwrap());
        assert!(kv.sadd("s", "bob").unwrap());
        assert_eq!(kv.scard("s").unwrap(), 2);
        assert!(kv.sismember("s", "bob").unwrap());
        assert!(kv.srem("s", "bob").unwrap());
        assert!(!kv.srem("s", "bob").unwrap());
        assert_eq!(kv.smembers("s").unwrap(), vec!["alice".to_string()]);

        kv.sclear("s").unwrap();
        assert_eq!(kv.scard("s").unwrap(), 0);
        assert!(kv.exists("s").unwrap());
    }

    #[test]
    fn test_wrong_type() {
        let (kv, _) = store();
        kv.sadd("s", "x").unwrap();
        let err = kv.hget_all("s").unwrap_err();
        assert!(matches!(err, StoreError::WrongType { expected: "hash", found: "set", .. }));
    }

    #[test]
    fn test_capped_list_keeps_newest() {
        let (kv, _) = store();
        for i in 0..7 {
            kv.rpush_capped("l", i.to_string(), 5).unwrap();
        }
        assert_eq!(kv.lrange_all("l").unwrap(), vec!["2", "3", "4", "5", "6"]);
    }

    #[test]
    fn test_flag_nx_expires() {
        let (kv, clock) = store();
        assert!(kv.set_flag_nx("lock", 1_000).unwrap());
        assert!(!kv.set_flag_nx("lock", 1_000).unwrap());

        clock.advance(Duration::from_millis(999));
        assert!(!kv.set_flag_nx("lock", 1_000).unwrap());

        clock.advance(Duration::from_millis(1));
        assert!(kv.set_flag_nx("lock", 1_000).unwrap());
    }

    #[test]
    fn test_expire_and_persist() {
        let (kv, clock) = store();
        kv.ensure_set("s").unwrap();
        assert!(kv.expire("s", 300_000).unwrap());
        assert_eq!(kv.ttl_ms("s").unwrap(), Some(300_000));

        // Writes keep the deadline.
        kv.sadd("s", "a").unwrap();
        clock.advance(Duration::from_secs(100));
        assert_eq!(kv.ttl_ms("s").unwrap(), Some(200_000));

        assert!(kv.persist("s").unwrap());
        assert_eq!(kv.ttl_ms("s").unwrap(), None);
        clock.advance(Duration::from_secs(1_000));
        assert!(kv.exists("s").unwrap());

        assert!(!kv.expire("missing", 10).unwrap());
        assert!(!kv.persist("missing").unwrap());
    }

    #[test]
    fn test_expired_reads_absent() {
        let (kv, clock) = store();
        kv.rpush_capped("l", "a".into(), 10).unwrap();
        kv.expire("l", 50).unwrap();
        clock.advance(Duration::from_millis(50));
        assert!(!kv.exists("l").unwrap());
        assert!(kv.lrange_all("l").unwrap().is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let (kv, clock) = store();
        kv.ensure_list("a").unwrap();
        kv.ensure_list("b").unwrap();
        kv.ensure_list("c").unwrap();
        kv.expire("a", 10).unwrap();
        kv.expire("b", 10).unwrap();
        clock.advance(Duration::from_millis(20));
        assert_eq!(kv.purge_expired().unwrap(), 2);
        assert!(kv.exists("c").unwrap());
    }

    #[test]
    fn test_entry_codec() {
        let entry = Entry {
            value: Value::List(vec!["x".into()]),
            expires_at: Some(42),
        };
        assert_eq!(Entry::decode(&entry.encode().unwrap()).unwrap(), entry);
        assert!(Entry::decode(&[0xFF, 0xFE]).is_err());
    }
}
