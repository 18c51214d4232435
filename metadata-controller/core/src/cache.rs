//! Publication target for node bundles.

use crate::MetadataMapperBundle;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A key-value store of node bundles with a per-entry time-to-live.
///
/// Writes replace an entry as a single unit. No multi-key transactions are assumed.
pub trait MappingCache: Send + Sync {
    /// Returns the bundle stored under `key`, or `None` if it is absent or expired.
    fn get(&self, key: &str) -> Result<Option<Arc<MetadataMapperBundle>>>;

    fn put(&self, key: String, bundle: Arc<MetadataMapperBundle>, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Builds the cache key for a node's bundle: `<prefix>:node:<node>`.
pub fn node_key(prefix: &str, node: &str) -> String {
    format!("{}:node:{}", prefix, node)
}

/// An in-process [`MappingCache`].
///
/// Expired entries are never returned. They are dropped lazily when read and in bulk by
/// [`TtlCache::purge_expired`].
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: RwLock<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    bundle: Arc<MetadataMapperBundle>,
    expires_at: Instant,
}

// === impl TtlCache ===

impl TtlCache {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drops all expired entries, returning the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Periodically purges expired entries. Never returns.
    pub async fn purge_every(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired bundles");
            }
        }
    }

    /// The number of entries, including those that have expired but not been purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl MappingCache for TtlCache {
    fn get(&self, key: &str) -> Result<Option<Arc<MetadataMapperBundle>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(e) if e.expires_at > now => return Ok(Some(e.bundle.clone())),
                Some(_) => {}
            }
        }

        // The entry expired; drop it unless it was replaced in the meantime.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    fn put(&self, key: String, bundle: Arc<MetadataMapperBundle>, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .insert(key, Entry { bundle, expires_at });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

impl<C: MappingCache + ?Sized> MappingCache for Arc<C> {
    fn get(&self, key: &str) -> Result<Option<Arc<MetadataMapperBundle>>> {
        (**self).get(key)
    }

    fn put(&self, key: String, bundle: Arc<MetadataMapperBundle>, ttl: Duration) -> Result<()> {
        (**self).put(key, bundle, ttl)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}
