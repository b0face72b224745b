//! TTL cache for intermediate node outputs
//!
//! Expiry is checked lazily on access; there is no background sweeper.
//! When the cache is full, expired entries are purged first and then the
//! least-recently-accessed entry is evicted. Ties are broken by the older
//! `created_at` and finally by key order, so eviction is deterministic.
//!
//! Snapshots copy entries under a key prefix into an independent store.
//! They give an inserted task partial isolation from its host: only keys
//! under the chosen prefix are protected, everything else is shared.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::config::CacheConfig;
use crate::core::errors::Result;

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn new(key: String, value: Value, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            created_at: now,
            expires_at: expiry_after(now, ttl),
            access_count: 0,
            last_accessed: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}

/// Point-in-time copy of selected entries
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub id: String,
    pub prefix: Option<String>,
    pub created_at: DateTime<Utc>,
    entries: HashMap<String, CacheEntry>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub snapshots: usize,
    pub max_size: usize,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub expired_count: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    snapshots: HashMap<String, CacheSnapshot>,
    stats: CacheStats,
}

impl CacheInner {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let purged = before - self.entries.len();
        self.stats.expired_count += purged as u64;
        purged
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .values()
            .min_by(|a, b| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.key.cmp(&b.key))
            })
            .map(|entry| entry.key.clone())?;
        self.entries.remove(&victim);
        self.stats.eviction_count += 1;
        Some(victim)
    }

    fn install(&mut self, entry: CacheEntry, max_entries: usize, now: DateTime<Utc>) {
        if !self.entries.contains_key(&entry.key) && self.entries.len() >= max_entries {
            self.purge_expired(now);
            while self.entries.len() >= max_entries {
                match self.evict_lru() {
                    Some(key) => debug!(key = %key, "Evicted least recently used cache entry"),
                    None => break,
                }
            }
        }
        self.entries.insert(entry.key.clone(), entry);
    }
}

/// Shared TTL key/value cache with snapshot support
pub struct CacheManager {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `value` under `key`, expiring `ttl` (or the default TTL) from now.
    pub fn set<K: Into<String>>(&self, key: K, value: Value, ttl: Option<Duration>) {
        let now = Utc::now();
        let entry = CacheEntry::new(
            key.into(),
            value,
            ttl.unwrap_or(self.config.default_ttl),
            now,
        );
        self.inner.lock().install(entry, self.config.max_entries, now);
    }

    /// Read a value, recording the access. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch(now);
                inner.stats.hit_count += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.stats.expired_count += 1;
            }
            None => {}
        }
        inner.stats.miss_count += 1;
        None
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Presence check without access bookkeeping
    pub fn has(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired_at(now),
            None => return false,
        };
        if expired {
            inner.entries.remove(key);
            inner.stats.expired_count += 1;
        }
        !expired
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Entry metadata without touching it
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy matching live entries into snapshot `id`, replacing any previous one.
    pub fn snapshot(&self, id: &str, prefix: Option<&str>) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let entries: HashMap<String, CacheEntry> = inner
            .entries
            .iter()
            .filter(|(key, entry)| {
                prefix.map_or(true, |p| key.starts_with(p)) && !entry.is_expired_at(now)
            })
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        let count = entries.len();
        inner.snapshots.insert(
            id.to_string(),
            CacheSnapshot {
                id: id.to_string(),
                prefix: prefix.map(str::to_string),
                created_at: now,
                entries,
            },
        );
        info!(snapshot_id = id, prefix = ?prefix, entries = count, "Created cache snapshot");
        count
    }

    /// Re-install the snapshot's unexpired entries. Returns `None` for an unknown id.
    pub fn restore(&self, id: &str) -> Option<usize> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let entries: Vec<CacheEntry> = inner
            .snapshots
            .get(id)?
            .entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
            .collect();
        let restored = entries.len();
        for entry in entries {
            inner.install(entry, self.config.max_entries, now);
        }
        info!(snapshot_id = id, restored, "Restored cache snapshot");
        Some(restored)
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.inner.lock().snapshots.contains_key(id)
    }

    pub fn clear_snapshot(&self, id: &str) -> bool {
        self.inner.lock().snapshots.remove(id).is_some()
    }

    pub fn clear_expired(&self) -> usize {
        let purged = self.inner.lock().purge_expired(Utc::now());
        if purged > 0 {
            debug!(purged, "Cleared expired cache entries");
        }
        purged
    }

    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        before - inner.entries.len()
    }

    /// Drop every entry and snapshot
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.snapshots.clear();
        info!("Cleared cache and snapshots");
    }

    /// Live entries under `prefix`, for persisting across a restart
    pub fn export_prefix(&self, prefix: &str) -> Vec<CacheEntry> {
        let now = Utc::now();
        let mut exported: Vec<CacheEntry> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.key.starts_with(prefix) && !entry.is_expired_at(now))
            .cloned()
            .collect();
        exported.sort_by(|a, b| a.key.cmp(&b.key));
        exported
    }

    /// Install previously exported entries, skipping any that have expired since
    pub fn import_entries(&self, entries: Vec<CacheEntry>) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut imported = 0;
        for entry in entries.into_iter().filter(|e| !e.is_expired_at(now)) {
            inner.install(entry, self.config.max_entries, now);
            imported += 1;
        }
        imported
    }

    pub fn info(&self) -> CacheInfo {
        let now = Utc::now();
        let inner = self.inner.lock();
        let total = inner.entries.len();
        let expired = inner
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .count();
        CacheInfo {
            total_entries: total,
            valid_entries: total - expired,
            expired_entries: expired,
            snapshots: inner.snapshots.len(),
            max_size: self.config.max_entries,
            usage_percent: total as f64 / self.config.max_entries as f64 * 100.0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}
