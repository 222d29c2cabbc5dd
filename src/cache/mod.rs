/// In-process read-through cache for BPN resolution
///
/// Keys are hashed onto independently locked LRU shards. Every shard keeps an
/// invalidation generation; a [`MissTicket`] remembers the generation seen at
/// lookup time and [`MappingCache::populate`] refuses to install a value once
/// that generation has moved on. A reader that fetched from the store before a
/// concurrent write can therefore never re-insert the old DID after the
/// write's invalidation.

use crate::{
    error::{BdrsError, BdrsResult},
    metrics,
};
use lru::LruCache;
use serde::Serialize;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Cache layer configuration
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    /// Enable caching (default: true)
    pub enabled: bool,

    /// Total number of entries across all shards
    pub capacity: usize,

    /// Number of independently locked shards
    pub shards: usize,

    /// Maximum age of a served entry; `None` disables expiry
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            shards: 16,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

struct CachedDid {
    did: String,
    inserted_at: Instant,
}

struct Shard {
    entries: LruCache<String, CachedDid>,
    generation: u64,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    Miss(MissTicket),
}

/// Permission to populate a key after a miss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissTicket {
    shard: usize,
    generation: Option<u64>,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// Sharded LRU cache of BPN to DID
pub struct MappingCache {
    shards: Vec<Mutex<Shard>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl MappingCache {
    /// Create a new cache
    pub fn new(config: CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let per_shard = config.capacity.div_ceil(shard_count).max(1);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::new(per_shard),
                    generation: 0,
                })
            })
            .collect();

        Self {
            shards,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// A cache that never holds anything
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            enabled: false,
            capacity: 1,
            shards: 1,
            ttl: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn shard_index(&self, bpn: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        bpn.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn lock_shard(&self, index: usize) -> BdrsResult<MutexGuard<'_, Shard>> {
        self.shards[index].lock().map_err(|_| {
            BdrsError::CacheInconsistency(format!("cache shard {} is poisoned", index))
        })
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_access(false);
    }

    /// Look up the DID cached for a BPN
    pub fn lookup(&self, bpn: &str) -> CacheLookup {
        let index = self.shard_index(bpn);

        if !self.config.enabled {
            return CacheLookup::Miss(MissTicket {
                shard: index,
                generation: None,
            });
        }

        let mut shard = match self.lock_shard(index) {
            Ok(shard) => shard,
            Err(e) => {
                warn!("Cache lookup degraded to store read: {}", e);
                self.record_miss();
                return CacheLookup::Miss(MissTicket {
                    shard: index,
                    generation: None,
                });
            }
        };

        let expired = match shard.entries.get(bpn) {
            Some(entry) => match self.config.ttl {
                Some(ttl) if entry.inserted_at.elapsed() >= ttl => true,
                _ => {
                    let did = entry.did.clone();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_access(true);
                    return CacheLookup::Hit(did);
                }
            },
            None => false,
        };

        if expired {
            debug!(bpn = %bpn, "Cache entry expired");
            shard.entries.pop(bpn);
        }

        self.record_miss();
        CacheLookup::Miss(MissTicket {
            shard: index,
            generation: Some(shard.generation),
        })
    }

    /// Install a value fetched after a miss.
    /// Returns whether the value was cached.
    pub fn populate(&self, bpn: &str, did: &str, ticket: MissTicket) -> bool {
        let Some(generation) = ticket.generation else {
            return false;
        };
        if ticket.shard != self.shard_index(bpn) {
            return false;
        }

        let mut shard = match self.lock_shard(ticket.shard) {
            Ok(shard) => shard,
            Err(_) => return false,
        };

        if shard.generation != generation {
            debug!(bpn = %bpn, "Discarding populate from before an invalidation");
            return false;
        }

        let evicted = shard.entries.push(
            bpn.to_string(),
            CachedDid {
                did: did.to_string(),
                inserted_at: Instant::now(),
            },
        );

        if matches!(evicted, Some((ref key, _)) if key != bpn) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_EVICTIONS_TOTAL.inc();
        }

        true
    }

    /// Drop the entry for a BPN and retire outstanding tickets of its shard
    pub fn invalidate(&self, bpn: &str) -> BdrsResult<()> {
        let index = self.shard_index(bpn);
        let mut shard = self.lock_shard(index)?;

        shard.entries.pop(bpn);
        shard.generation = shard.generation.wrapping_add(1);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_invalidation("key");
        Ok(())
    }

    /// Drop every entry.
    /// Poisoned shards are recovered by clearing them.
    pub fn invalidate_all(&self) -> BdrsResult<()> {
        for (index, lock) in self.shards.iter().enumerate() {
            let mut shard = match lock.lock() {
                Ok(shard) => shard,
                Err(poisoned) => {
                    warn!("Recovering poisoned cache shard {}", index);
                    let shard = poisoned.into_inner();
                    lock.clear_poison();
                    shard
                }
            };
            shard.entries.clear();
            shard.generation = shard.generation.wrapping_add(1);
        }

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_invalidation("all");
        Ok(())
    }

    /// Release all entries, used at shutdown
    pub fn clear(&self) {
        // invalidate_all never fails; it recovers poisoned shards
        let _ = self.invalidate_all();
        metrics::CACHE_SIZE.set(0);
    }

    /// Poison the shard holding `bpn` by panicking while its lock is held
    #[cfg(test)]
    pub(crate) fn poison_shard_for_test(&self, bpn: &str) {
        let lock = &self.shards[self.shard_index(bpn)];
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("cache shard poisoned for test");
        }));
        assert!(lock.is_poisoned());
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|lock| lock.lock().ok().map(|shard| shard.entries.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let entries = self.len();
        metrics::CACHE_SIZE.set(entries as i64);

        CacheStats {
            enabled: self.config.enabled,
            entries,
            capacity: self.config.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_shard(capacity: usize, ttl: Option<Duration>) -> MappingCache {
        MappingCache::new(CacheConfig {
            enabled: true,
            capacity,
            shards: 1,
            ttl,
        })
    }

    fn miss(cache: &MappingCache, bpn: &str) -> MissTicket {
        match cache.lookup(bpn) {
            CacheLookup::Miss(ticket) => ticket,
            CacheLookup::Hit(did) => panic!("unexpected hit: {}", did),
        }
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.ttl, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_read_through() {
        let cache = MappingCache::new(CacheConfig::default());
        let ticket = miss(&cache, "BPNL000000000001");
        assert!(cache.populate("BPNL000000000001", "did:web:example.com", ticket));

        assert_eq!(
            cache.lookup("BPNL000000000001"),
            CacheLookup::Hit("did:web:example.com".to_string())
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_stale_ticket_is_discarded() {
        let cache = MappingCache::new(CacheConfig::default());

        // Reader misses and goes to the store
        let ticket = miss(&cache, "BPNL000000000001");

        // A writer commits and invalidates in the meantime
        cache.invalidate("BPNL000000000001").unwrap();

        assert!(!cache.populate("BPNL000000000001", "did:web:old.example", ticket));
        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Miss(_)));
    }

    #[test]
    fn test_invalidate_all_retires_tickets() {
        let cache = MappingCache::new(CacheConfig::default());
        let ticket = miss(&cache, "BPNL000000000001");
        cache.invalidate_all().unwrap();
        assert!(!cache.populate("BPNL000000000001", "did:web:old.example", ticket));
    }

    #[test]
    fn test_ttl_expired_entries_not_served() {
        let cache = single_shard(10, Some(Duration::from_millis(20)));
        let ticket = miss(&cache, "BPNL000000000001");
        cache.populate("BPNL000000000001", "did:web:example.com", ticket);

        std::thread::sleep(Duration::from_millis(40));

        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Miss(_)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = single_shard(2, None);
        for bpn in ["BPNL000000000001", "BPNL000000000002"] {
            let ticket = miss(&cache, bpn);
            cache.populate(bpn, "did:web:example.com", ticket);
        }

        // Touch 1 so 2 becomes least recently used
        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Hit(_)));

        let ticket = miss(&cache, "BPNL000000000003");
        cache.populate("BPNL000000000003", "did:web:example.com", ticket);

        assert!(matches!(cache.lookup("BPNL000000000002"), CacheLookup::Miss(_)));
        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Hit(_)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = MappingCache::disabled();
        let ticket = miss(&cache, "BPNL000000000001");
        assert!(!cache.populate("BPNL000000000001", "did:web:example.com", ticket));
        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Miss(_)));
    }

    #[test]
    fn test_clear() {
        let cache = MappingCache::new(CacheConfig::default());
        let ticket = miss(&cache, "BPNL000000000001");
        cache.populate("BPNL000000000001", "did:web:example.com", ticket);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_poisoned_shard_misses_until_recovered() {
        let cache = single_shard(10, None);
        let ticket = miss(&cache, "BPNL000000000001");
        cache.populate("BPNL000000000001", "did:web:example.com", ticket);

        cache.poison_shard_for_test("BPNL000000000001");
        let ticket = miss(&cache, "BPNL000000000001");
        assert!(!cache.populate("BPNL000000000001", "did:web:example.org", ticket));
        assert!(matches!(
            cache.invalidate("BPNL000000000001"),
            Err(BdrsError::CacheInconsistency(_))
        ));

        cache.invalidate_all().unwrap();
        assert!(cache.is_empty());
        let ticket = miss(&cache, "BPNL000000000001");
        assert!(cache.populate("BPNL000000000001", "did:web:example.org", ticket));
        assert!(matches!(cache.lookup("BPNL000000000001"), CacheLookup::Hit(_)));
    }
}
