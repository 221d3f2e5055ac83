//! Rolling unique-visitor tracking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::TimeSource;
use crate::error::Result;

/// How far back an address still counts as unique.
const WINDOW: f64 = 24.0 * 60.0 * 60.0;
/// How often the table is pruned and snapshotted.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Rolling 24-hour table of client addresses.
///
/// Every request records its client; a minute-cadence prune drops stale
/// entries and snapshots the table to disk, replacing the file atomically.
/// The table feeds a single introspection endpoint.
pub struct Uniques {
    clock: Arc<dyn TimeSource>,
    path: Option<PathBuf>,
    seen: Mutex<HashMap<String, f64>>,
}

impl std::fmt::Debug for Uniques {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uniques")
            .field("seen", &self.seen.lock().len())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Uniques {
    /// Creates the table, loading an earlier snapshot when one exists.
    pub fn new(clock: Arc<dyn TimeSource>, path: Option<PathBuf>) -> Self {
        let seen = match &path {
            Some(path) if path.exists() => {
                match std::fs::read(path)
                    .map_err(crate::error::ProxyError::from)
                    .and_then(|raw| Ok(serde_json::from_slice(&raw)?))
                {
                    Ok(seen) => seen,
                    Err(err) => {
                        warn!(%err, "could not load uniques snapshot");
                        HashMap::new()
                    }
                }
            }
            _ => HashMap::new(),
        };
        Self { clock, path, seen: Mutex::new(seen) }
    }

    /// Records a sighting of `ip`.
    pub fn record(&self, ip: &str) {
        self.seen.lock().insert(ip.to_string(), self.clock.now());
    }

    /// The current unique addresses, comma-joined for the endpoint.
    pub fn list(&self) -> String {
        let seen = self.seen.lock();
        let mut ips: Vec<&str> = seen.keys().map(String::as_str).collect();
        ips.sort_unstable();
        ips.join(",")
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Drops entries older than the window and snapshots what remains.
    pub async fn prune(&self) -> Result<()> {
        let cutoff = self.clock.now() - WINDOW;
        let snapshot = {
            let mut seen = self.seen.lock();
            seen.retain(|_, stamp| *stamp >= cutoff);
            seen.clone()
        };
        if let Some(path) = &self.path {
            let staging = path.with_extension("tmp");
            let raw = serde_json::to_vec(&snapshot)?;
            tokio::fs::write(&staging, raw).await?;
            tokio::fs::rename(&staging, path).await?;
            debug!(entries = snapshot.len(), "snapshotted uniques");
        }
        Ok(())
    }

    /// Prunes forever on the minute cadence.
    pub async fn prune_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.prune().await {
                warn!(%err, "unable to prune uniques");
            }
        }
    }
}
