use std::collections::HashMap;

use super::{CacheBackend, Element};
use crate::error::Result;

/// The cache that caches nothing.
///
/// Reads answer the full key set mapped to misses, writes and deletes are
/// no-ops. Useful for flushing-by-configuration and for measuring the
/// origin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

#[async_trait::async_trait]
impl CacheBackend for NullBackend {
    async fn get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Element>>> {
        Ok(keys.iter().map(|key| (key.clone(), None)).collect())
    }

    async fn set(
        &self,
        _entries: HashMap<String, Element>,
        _ttl: u64,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
