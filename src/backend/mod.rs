//! Cache backends.
//!
//! A backend is a uniform `{get, set, delete, flush}` container the data
//! store rides on. Three interchangeable variants exist, selected from
//! configuration at startup: [`LocalBackend`] (process-local map),
//! [`RemoteBackend`] (network key-value store), and [`NullBackend`]
//! (caches nothing). All of them answer `get` with the full requested key
//! set so callers need no special casing for misses.

mod local;
mod null;
mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::TimeSource;
use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::kv::KvClient;
use crate::message::Message;

pub use local::LocalBackend;
pub use null::NullBackend;
pub use remote::RemoteBackend;

/// A rendered origin response held in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEntry {
    /// The origin response, cookies cleared before any shared store
    pub response: Message,
    /// Unix seconds when the origin rendered this copy
    pub rendered_on: f64,
    /// Declared freshness window in seconds
    pub cache_control: u64,
}

/// A value stored under a cache key.
///
/// Every element kind maps to one of these shapes; the remote backend
/// serializes them with a self-describing encoding so a value read back
/// carries its own shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Element {
    /// A cached page
    Page(PageEntry),
    /// A bare timestamp, used by the expiration sentinel
    Stamp(f64),
    /// A raw string value from a key-value store
    Text(String),
    /// A list of names, used for A/B dependencies
    List(Vec<String>),
    /// A field mapping: sessions, cohorts, counters-by-name
    Map(HashMap<String, String>),
}

impl Element {
    /// The page entry, if this is one.
    pub fn as_page(&self) -> Option<&PageEntry> {
        match self {
            Element::Page(entry) => Some(entry),
            _ => None,
        }
    }

    /// The timestamp, if this is one.
    pub fn as_stamp(&self) -> Option<f64> {
        match self {
            Element::Stamp(stamp) => Some(*stamp),
            _ => None,
        }
    }

    /// The raw string, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Element::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The name list, if this is one.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Element::List(list) => Some(list),
            _ => None,
        }
    }

    /// The field mapping, if this is one.
    pub fn as_map(&self) -> Option<&HashMap<String, String>> {
        match self {
            Element::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// A uniform async container for cache elements.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Reads `keys`, answering every one of them; misses map to `None`.
    async fn get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Element>>>;

    /// Stores every entry for `ttl` seconds.
    async fn set(&self, entries: HashMap<String, Element>, ttl: u64) -> Result<()>;

    /// Drops `keys`.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Drops everything. Not every backend supports this.
    async fn flush(&self) -> Result<()>;
}

/// Builds the configured backend variant.
pub fn from_config(
    config: &Config,
    kv: Arc<dyn KvClient>,
    clock: Arc<dyn TimeSource>,
) -> Arc<dyn CacheBackend> {
    match config.cache_backend {
        BackendKind::Local => Arc::new(LocalBackend::new(clock)),
        BackendKind::Remote => Arc::new(RemoteBackend::new(kv)),
        BackendKind::Null => Arc::new(NullBackend),
    }
}
