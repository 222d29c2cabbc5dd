/// Resolution Engine
///
/// Serves lookups through the cache, routes writes through the store's
/// optimistic-concurrency contract and keeps the cache and the directory
/// dump in line with committed state. A write is acknowledged only after its
/// cache entry has been invalidated (or queued for reconciliation).

pub mod directory;

use crate::{
    cache::{CacheLookup, CacheStats, MappingCache},
    error::{BdrsError, BdrsResult},
    metrics,
    store::{MappingRecord, MappingStore, NewMapping, RecordPage},
    validation::{validate_bpn, validate_did},
};
use directory::{encode_directory, DirectorySnapshot};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Directory version before the first poll
const VERSION_UNOBSERVED: i64 = -1;

/// Bounded exponential backoff for transient store failures
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), with up to one base
    /// interval of random jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let base_ms = self.base_backoff.as_millis() as u64;
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..=base_ms)
        } else {
            0
        };
        exponential + Duration::from_millis(jitter)
    }
}

/// Engine policy
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub batch_max_size: usize,
    pub page_size_default: usize,
    pub page_size_max: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_max_size: 1000,
            page_size_default: 100,
            page_size_max: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-key result of a batch resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOutcome {
    Found { did: String },
    NotFound,
    InvalidInput { message: String },
}

/// BPN resolution over a mapping store and a cache
pub struct ResolutionEngine<S: MappingStore> {
    store: S,
    cache: Arc<MappingCache>,
    config: EngineConfig,
    snapshot: DirectorySnapshot,
    /// Keys whose post-commit invalidation failed
    pending_invalidations: Mutex<HashSet<String>>,
    observed_version: AtomicI64,
}

impl<S: MappingStore> ResolutionEngine<S> {
    pub fn new(store: S, cache: Arc<MappingCache>, config: EngineConfig) -> Self {
        Self {
            store,
            cache,
            config,
            snapshot: DirectorySnapshot::new(),
            pending_invalidations: Mutex::new(HashSet::new()),
            observed_version: AtomicI64::new(VERSION_UNOBSERVED),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run a store call, retrying transient failures
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> BdrsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BdrsResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = call().await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.code(),
            };
            metrics::record_store_operation(operation, outcome, started.elapsed().as_secs_f64());

            match result {
                Err(e) if e.is_transient() && attempt < self.config.retry.attempts => {
                    let delay = self.config.retry.backoff(attempt);
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient store failure, retrying: {}",
                        e
                    );
                    metrics::record_store_retry(operation);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pending_invalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue_reconciliation(&self, bpn: &str) {
        self.pending().insert(bpn.to_string());
    }

    /// Post-commit step of every write. Never fails the write.
    fn invalidate_after_write(&self, bpn: &str) {
        if let Err(e) = self.cache.invalidate(bpn) {
            warn!(bpn = %bpn, "Cache invalidation failed, queued for reconciliation: {}", e);
            metrics::record_error(e.code(), "cache");
            self.queue_reconciliation(bpn);
        }
        self.snapshot.invalidate();
    }

    /// Follow the directory version past our own commit so the next poll does
    /// not clear the cache for it. Any other write in between leaves a gap
    /// and still forces a clear.
    fn advance_observed_version(&self, committed: i64) {
        let _ = self.observed_version.compare_exchange(
            committed - 1,
            committed,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn note_conflict(operation: &str, err: &BdrsError) {
        if matches!(err, BdrsError::VersionConflict { .. }) {
            metrics::record_version_conflict(operation);
        }
    }

    /// Current DID for a BPN
    pub async fn resolve(&self, bpn: &str) -> BdrsResult<String> {
        validate_bpn(bpn)?;

        match self.cache.lookup(bpn) {
            CacheLookup::Hit(did) => Ok(did),
            CacheLookup::Miss(ticket) => {
                let record = self.with_retry("get", move || self.store.get(bpn)).await?;
                self.cache.populate(bpn, &record.did, ticket);
                Ok(record.did)
            }
        }
    }

    /// Resolve many BPNs with a per-key outcome
    pub async fn resolve_batch(
        &self,
        bpns: &[String],
    ) -> BdrsResult<BTreeMap<String, BatchOutcome>> {
        if bpns.len() > self.config.batch_max_size {
            return Err(BdrsError::Validation(format!(
                "Batch of {} BPNs exceeds the maximum of {}",
                bpns.len(),
                self.config.batch_max_size
            )));
        }

        let mut results = BTreeMap::new();
        let mut misses = Vec::new();
        let mut seen = HashSet::with_capacity(bpns.len());

        for bpn in bpns {
            if !seen.insert(bpn.as_str()) {
                continue;
            }

            if let Err(e) = validate_bpn(bpn) {
                results.insert(
                    bpn.clone(),
                    BatchOutcome::InvalidInput {
                        message: e.to_string(),
                    },
                );
                continue;
            }

            match self.cache.lookup(bpn) {
                CacheLookup::Hit(did) => {
                    results.insert(bpn.clone(), BatchOutcome::Found { did });
                }
                CacheLookup::Miss(ticket) => misses.push((bpn.clone(), ticket)),
            }
        }

        if !misses.is_empty() {
            let keys: Vec<String> = misses.iter().map(|(bpn, _)| bpn.clone()).collect();
            let keys = &keys;
            let found: BTreeMap<String, String> = self
                .with_retry("get_many", move || self.store.get_many(keys))
                .await?
                .into_iter()
                .map(|record| (record.bpn, record.did))
                .collect();

            for (bpn, ticket) in misses {
                let outcome = match found.get(&bpn) {
                    Some(did) => {
                        self.cache.populate(&bpn, did, ticket);
                        BatchOutcome::Found { did: did.clone() }
                    }
                    None => BatchOutcome::NotFound,
                };
                results.insert(bpn, outcome);
            }
        }

        debug!(requested = bpns.len(), resolved = results.len(), "Batch resolution");
        Ok(results)
    }

    /// Create a new mapping
    pub async fn register(&self, bpn: &str, did: &str) -> BdrsResult<MappingRecord> {
        validate_bpn(bpn)?;
        validate_did(did)?;

        let committed = self
            .with_retry("put", move || self.store.put(bpn, did, None))
            .await?;
        self.invalidate_after_write(bpn);
        self.advance_observed_version(committed.directory_version);
        let record = committed.value;

        info!(bpn = %bpn, did = %did, "Registered mapping");
        Ok(record)
    }

    /// Replace the DID of an existing mapping
    pub async fn rotate(
        &self,
        bpn: &str,
        new_did: &str,
        expected_version: i64,
    ) -> BdrsResult<MappingRecord> {
        validate_bpn(bpn)?;
        validate_did(new_did)?;

        let committed = self
            .with_retry("put", move || {
                self.store.put(bpn, new_did, Some(expected_version))
            })
            .await
            .inspect_err(|e| Self::note_conflict("rotate", e))?;
        self.invalidate_after_write(bpn);
        self.advance_observed_version(committed.directory_version);
        let record = committed.value;

        info!(bpn = %bpn, did = %new_did, version = record.version, "Rotated mapping");
        Ok(record)
    }

    /// Delete a mapping
    pub async fn remove(&self, bpn: &str, expected_version: i64) -> BdrsResult<()> {
        validate_bpn(bpn)?;

        let committed = self
            .with_retry("delete", move || self.store.delete(bpn, expected_version))
            .await
            .inspect_err(|e| Self::note_conflict("remove", e))?;
        self.invalidate_after_write(bpn);
        self.advance_observed_version(committed.directory_version);

        info!(bpn = %bpn, "Removed mapping");
        Ok(())
    }

    /// Full record, read from the store
    pub async fn record(&self, bpn: &str) -> BdrsResult<MappingRecord> {
        validate_bpn(bpn)?;
        self.with_retry("get", move || self.store.get(bpn)).await
    }

    /// All mappings pointing at a DID
    pub async fn find_by_did(&self, did: &str) -> BdrsResult<Vec<MappingRecord>> {
        validate_did(did)?;
        self.with_retry("find_by_did", move || self.store.find_by_did(did))
            .await
    }

    /// One page of mappings ordered by BPN
    pub async fn list(
        &self,
        page_token: Option<&str>,
        page_size: Option<usize>,
    ) -> BdrsResult<RecordPage> {
        let page_size = match page_size {
            Some(0) => {
                return Err(BdrsError::Validation(
                    "pageSize must be positive".to_string(),
                ))
            }
            Some(size) => size.min(self.config.page_size_max),
            None => self.config.page_size_default,
        };

        self.with_retry("list_all", move || self.store.list_all(page_token, page_size))
            .await
    }

    /// Create many mappings in one transaction
    pub async fn register_batch(&self, entries: &[NewMapping]) -> BdrsResult<Vec<MappingRecord>> {
        if entries.is_empty() {
            return Err(BdrsError::Validation("Batch cannot be empty".to_string()));
        }
        if entries.len() > self.config.batch_max_size {
            return Err(BdrsError::Validation(format!(
                "Batch of {} entries exceeds the maximum of {}",
                entries.len(),
                self.config.batch_max_size
            )));
        }
        for entry in entries {
            validate_bpn(&entry.bpn)?;
            validate_did(&entry.did)?;
        }

        let committed = self
            .with_retry("put_batch", move || self.store.put_batch(entries))
            .await?;
        for record in &committed.value {
            self.invalidate_after_write(&record.bpn);
        }
        self.advance_observed_version(committed.directory_version);
        let records = committed.value;

        info!(count = records.len(), "Registered mapping batch");
        Ok(records)
    }

    /// Gzip-compressed JSON map of the whole directory
    pub async fn directory_snapshot(&self) -> BdrsResult<Arc<Vec<u8>>> {
        if let Some(encoded) = self.snapshot.current() {
            return Ok(encoded);
        }

        let generation = self.snapshot.generation();
        let entries = self
            .with_retry("snapshot", move || self.store.snapshot())
            .await?;
        let encoded = Arc::new(encode_directory(&entries)?);

        if self.snapshot.install(generation, Arc::clone(&encoded)) {
            debug!(entries = entries.len(), bytes = encoded.len(), "Rebuilt directory dump");
        }
        Ok(encoded)
    }

    /// Retry invalidations that failed after a commit.
    /// Falls back to clearing the whole cache. Returns the number of keys handled.
    pub fn reconcile(&self) -> BdrsResult<usize> {
        let pending: Vec<String> = self.pending().drain().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let failed = pending
            .iter()
            .filter(|bpn| self.cache.invalidate(bpn).is_err())
            .count();

        if failed > 0 {
            warn!(failed, "Reconciliation could not invalidate keys, clearing cache");
            self.cache.invalidate_all()?;
        }
        self.snapshot.invalidate();

        info!(keys = pending.len(), "Reconciled cache");
        Ok(pending.len())
    }

    /// Number of keys awaiting reconciliation
    pub fn pending_reconciliation(&self) -> usize {
        self.pending().len()
    }

    /// Compare the store's directory version with the last one seen and drop
    /// cached state when it moved. Returns whether anything was invalidated.
    pub async fn poll_directory_version(&self) -> BdrsResult<bool> {
        let version = self
            .with_retry("directory_version", move || self.store.directory_version())
            .await?;
        metrics::DIRECTORY_VERSION.set(version);

        let previous = self.observed_version.swap(version, Ordering::SeqCst);
        if previous == VERSION_UNOBSERVED || previous == version {
            return Ok(false);
        }

        debug!(previous, version, "Directory version changed, invalidating caches");
        self.cache.invalidate_all()?;
        self.snapshot.invalidate();
        Ok(true)
    }

    /// Last directory version seen by the poller
    pub fn observed_version(&self) -> Option<i64> {
        match self.observed_version.load(Ordering::SeqCst) {
            VERSION_UNOBSERVED => None,
            version => Some(version),
        }
    }

    /// Store connectivity
    pub async fn ping(&self) -> BdrsResult<()> {
        self.store.ping().await
    }

    /// Release cached state
    pub fn shutdown(&self) {
        self.cache.clear();
        self.snapshot.invalidate();
        info!("Resolution engine shut down");
    }
}
