use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use super::{CacheBackend, Element};
use crate::error::Result;
use crate::kv::KvClient;

/// Cache over a remote key-value store.
///
/// Keys are digested to a fixed width before they hit the wire so
/// arbitrarily long page keys stay transportable; values travel as a
/// self-describing encoding. Multi-key operations batch into one round
/// trip. `flush` is unsupported.
pub struct RemoteBackend {
    kv: Arc<dyn KvClient>,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend").finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Wraps a key-value client.
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    fn digest(key: &str) -> String {
        hex::encode(blake3::hash(key.as_bytes()).as_bytes())
    }
}

#[async_trait::async_trait]
impl CacheBackend for RemoteBackend {
    async fn get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Element>>> {
        let digests: Vec<String> =
            keys.iter().map(|key| Self::digest(key)).collect();
        let raw = self.kv.get_multi(&digests).await?;
        Ok(keys
            .iter()
            .zip(&digests)
            .map(|(key, digest)| {
                let element = raw.get(digest).and_then(|bytes| {
                    serde_json::from_slice(bytes)
                        .map_err(|err| {
                            warn!(%key, %err, "discarding undecodable cache value");
                        })
                        .ok()
                });
                (key.clone(), element)
            })
            .collect())
    }

    async fn set(&self, entries: HashMap<String, Element>, ttl: u64) -> Result<()> {
        let mut encoded = HashMap::with_capacity(entries.len());
        for (key, element) in entries {
            encoded.insert(Self::digest(&key), serde_json::to_vec(&element)?);
        }
        if encoded.is_empty() {
            return Ok(());
        }
        self.kv.set_multi(encoded, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let digests: Vec<String> =
            keys.iter().map(|key| Self::digest(key)).collect();
        self.kv.delete_multi(&digests).await
    }

    async fn flush(&self) -> Result<()> {
        error!("unsupported operation flush() on the remote cache backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn backend() -> RemoteBackend {
        RemoteBackend::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn values_round_trip_through_digested_keys() {
        let cache = backend();
        let key = "page_www.example.com/a//en-us".to_string();
        cache
            .set(
                HashMap::from([(key.clone(), Element::Text("body".into()))]),
                600,
            )
            .await
            .unwrap();
        let out = cache.get(std::slice::from_ref(&key)).await.unwrap();
        assert_eq!(out[&key].as_ref().and_then(|e| e.as_text()), Some("body"));
    }

    #[tokio::test]
    async fn digests_have_fixed_width() {
        let short = RemoteBackend::digest("a");
        let long = RemoteBackend::digest(&"x".repeat(4096));
        assert_eq!(short.len(), 64);
        assert_eq!(long.len(), 64);
        assert_ne!(short, long);
    }

    #[tokio::test]
    async fn misses_still_answer_every_key() {
        let cache = backend();
        let out = cache
            .get(&["expiration_/a".to_string(), "session_9".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.values().all(|element| element.is_none()));
    }

    #[tokio::test]
    async fn delete_removes_digested_entries() {
        let cache = backend();
        let key = "memcache_counter".to_string();
        cache
            .set(HashMap::from([(key.clone(), Element::Text("3".into()))]), 30)
            .await
            .unwrap();
        cache.delete(std::slice::from_ref(&key)).await.unwrap();
        let out = cache.get(std::slice::from_ref(&key)).await.unwrap();
        assert!(out[&key].is_none());
    }
}
