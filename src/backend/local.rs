use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CacheBackend, Element};
use crate::clock::TimeSource;
use crate::error::Result;

struct Stored {
    expires_on: f64,
    element: Element,
}

/// Process-local cache: a guarded map whose values carry their own expiry.
///
/// Reads of expired entries answer as misses but do not evict; `delete`
/// and `flush` are the only ways space is reclaimed.
pub struct LocalBackend {
    clock: Arc<dyn TimeSource>,
    entries: Mutex<HashMap<String, Stored>>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Creates an empty cache reading time from `clock`.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self { clock, entries: Mutex::new(HashMap::new()) }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Element>>> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| {
                let hit = entries
                    .get(key)
                    .filter(|stored| now <= stored.expires_on)
                    .map(|stored| stored.element.clone());
                (key.clone(), hit)
            })
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Element>, ttl: u64) -> Result<()> {
        let expires_on = self.clock.now() + ttl as f64;
        let mut stored = self.entries.lock();
        for (key, element) in entries {
            stored.insert(key, Stored { expires_on, element });
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
