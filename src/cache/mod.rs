//! Per-target rate-limited cache for expensive remote lookups.
//!
//! Entries are independent: a slow producer for one target never holds a
//! lock that another target's lookup needs.

mod sweeper;

pub use sweeper::*;

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    label: String,
}

/// Diagnostics for a single cached entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    pub target_id: i64,
    pub target_name: String,
    pub age_secs: u64,
    pub expires_in_secs: u64,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub cache_duration_secs: u64,
    pub entries: Vec<EntryStats>,
}

/// Short-TTL memoization keyed by target ID.
pub struct RateCache<V> {
    ttl: Duration,
    entries: DashMap<i64, CacheEntry<V>>,
}

impl<V: Clone> RateCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Return the cached value for `key` if younger than the TTL, otherwise
    /// run `producer` and cache its result.
    ///
    /// Failed producers are not cached, so the next call retries.
    pub async fn get<F, Fut, E>(&self, key: i64, label: &str, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.fresh(key) {
            tracing::debug!("Cache hit for target {} ({})", key, label);
            return Ok(value);
        }

        tracing::debug!("Cache miss for target {} ({}), querying", key, label);
        let value = producer().await?;

        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                stored_at: Instant::now(),
                label: label.to_string(),
            },
        );

        Ok(value)
    }

    fn fresh(&self, key: i64) -> Option<V> {
        let entry = self.entries.get(&key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Drop one entry, or every entry when `key` is `None`.
    ///
    /// Returns how many entries were removed.
    pub fn invalidate(&self, key: Option<i64>) -> usize {
        match key {
            Some(k) => {
                let removed = self.entries.remove(&k).is_some();
                tracing::info!("Cache cleared for target {} (existed: {})", k, removed);
                usize::from(removed)
            }
            None => {
                let size = self.entries.len();
                self.entries.clear();
                tracing::info!("Cache cleared, {} entries removed", size);
                size
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries: Vec<EntryStats> = self
            .entries
            .iter()
            .map(|e| {
                let age = e.stored_at.elapsed();
                EntryStats {
                    target_id: *e.key(),
                    target_name: e.label.clone(),
                    age_secs: age.as_secs(),
                    expires_in_secs: self.ttl.saturating_sub(age).as_secs(),
                }
            })
            .collect();
        entries.sort_by_key(|e| e.target_id);

        CacheStats {
            total_entries: entries.len(),
            cache_duration_secs: self.ttl.as_secs(),
            entries,
        }
    }

    /// Remove every entry whose age has reached the TTL.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, e| {
            let keep = e.stored_at.elapsed() < self.ttl;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::info!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }
}

/// Anything the background sweeper can expire.
pub trait Sweep: Send + Sync {
    fn sweep(&self) -> usize;
}

impl<V: Clone + Send + Sync> Sweep for RateCache<V> {
    fn sweep(&self) -> usize {
        RateCache::sweep(self)
    }
}
