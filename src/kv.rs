//! The asynchronous key-value client contract.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;

/// Contract over a remote key-value store.
///
/// All operations are asynchronous; the wire protocol behind them is not
/// part of this crate. Values are opaque byte vectors; counters are ASCII
/// integers so `incr`/`decr` compose with plain `set`.
#[async_trait::async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads many keys in one round trip; misses are absent from the map.
    async fn get_multi(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>>;

    /// Writes one key. `ttl` of zero means "no expiry".
    async fn set(&self, key: &str, value: Vec<u8>, ttl: u64) -> Result<()>;

    /// Writes many keys in one round trip.
    async fn set_multi(
        &self,
        entries: HashMap<String, Vec<u8>>,
        ttl: u64,
    ) -> Result<()>;

    /// Drops one key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Drops many keys in one round trip.
    async fn delete_multi(&self, keys: &[String]) -> Result<()>;

    /// Adds one to a counter, answering the new value; absent keys are
    /// left alone and answer `None`.
    async fn incr(&self, key: &str) -> Result<Option<u64>>;

    /// Subtracts one from a counter, saturating at zero; absent keys are
    /// left alone and answer `None`.
    async fn decr(&self, key: &str) -> Result<Option<u64>>;

    /// Writes `value` only when `key` is absent; answers whether it wrote.
    async fn add(&self, key: &str, value: Vec<u8>) -> Result<bool>;
}

/// An in-process [`KvClient`].
///
/// Stands in wherever a real server is not configured: development, tests,
/// and the default durable store for cohort persistence. TTLs are ignored.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: &str, delta: i64) -> Option<u64> {
        let mut entries = self.entries.lock();
        let current = entries.get(key)?;
        let current: u64 =
            std::str::from_utf8(current).ok()?.trim().parse().ok()?;
        let next = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta as u64)
        };
        entries.insert(key.to_string(), next.to_string().into_bytes());
        Some(next)
    }
}

#[async_trait::async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn get_multi(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>> {
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|key| {
                entries.get(key).map(|value| (key.clone(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>, _ttl: u64) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn set_multi(
        &self,
        entries: HashMap<String, Vec<u8>>,
        _ttl: u64,
    ) -> Result<()> {
        self.entries.lock().extend(entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.bump(key, 1))
    }

    async fn decr(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.bump(key, -1))
    }

    async fn add(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}
