//! The tiered cache: an in-memory LRU in front of the durable cache.
//!
//! This is the type callers hold. Hot lookups are answered from a bounded
//! idle-TTL LRU; misses fall through to the bidirectional cache and the
//! answer is memoized together with cheap input variations, so the next
//! paraphrase is a memory hit. The operation wrapper adds self-healing:
//! failed selectors are invalidated in both tiers and replaced by the first
//! working generated fallback.
//!
//! Transient storage errors are absorbed here (logged and counted); callers
//! see configuration errors at construction, explicit close errors, and an
//! operation's own failure once every fallback is exhausted.

use crate::bidirectional::{BidirectionalCache, CacheHit, HitSource};
use crate::configuration::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fallback::universal_fallbacks;
use crate::keys::TestStep;
use crate::normalize::normalize;
use crate::signature::SnapshotProvider;
use crate::similarity::action_synonyms;
use crate::snapshot::{SnapshotGetOptions, SnapshotPayload, SnapshotSetOptions};
use crate::store::{MappingExport, StorageCounts};
use hashbrown::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Upper bound on pre-cached variations per stored entry.
const MAX_VARIATIONS: usize = 8;
/// How many stored mappings a warm start loads.
const PRELOAD_LIMIT: i64 = 50;

/// One memoized lookup answer.
#[derive(Debug, Clone)]
struct MemoryEntry {
    hit: CacheHit,
    last_access: Instant,
}

/// Counters for the memory tier.
#[derive(Debug, Default)]
struct MemoryCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded idle-TTL LRU protected by one lock; the lock is held only around
/// individual entry operations, bulk invalidation takes it once.
#[derive(Debug)]
struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    max_entries: usize,
    idle_ttl: Duration,
    counters: MemoryCounters,
}

impl MemoryCache {
    fn new(max_entries: usize, idle_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_entries.min(10_000))),
            max_entries,
            idle_ttl,
            counters: MemoryCounters::default(),
        }
    }

    async fn get(&self, key: &str) -> Option<CacheHit> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.last_access.elapsed() > self.idle_ttl {
                entries.remove(key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_access = Instant::now();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.hit.clone())
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn insert(&self, key: String, hit: CacheHit) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            if let Some(lru) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            MemoryEntry {
                hit,
                last_access: Instant::now(),
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drop every entry scoped to a URL.
    async fn remove_url(&self, url: &str) {
        let suffix = format!("|{}", url);
        self.entries
            .write()
            .await
            .retain(|key, _| !key.ends_with(&suffix));
    }

    /// Drop every entry resolving to a selector on a URL.
    async fn remove_selector(&self, selector: &str, url: &str) {
        let suffix = format!("|{}", url);
        self.entries
            .write()
            .await
            .retain(|key, entry| !(key.ends_with(&suffix) && entry.hit.selector == selector));
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Per-level hit counters, as exposed by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct HitCounts {
    /// Exact-level hits.
    pub exact: u64,
    /// Normalized-level hits.
    pub normalized: u64,
    /// Reverse-level hits.
    pub reverse: u64,
    /// Fuzzy-level hits.
    pub fuzzy: u64,
    /// Enhanced-key hits.
    pub enhanced: u64,
}

/// Memory-tier statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MemoryStats {
    /// Live entries.
    pub entries: u64,
    /// Memory hits.
    pub hits: u64,
    /// Memory misses (fell through to the durable tier).
    pub misses: u64,
    /// LRU evictions.
    pub evictions: u64,
    /// Idle-TTL expirations.
    pub expirations: u64,
}

/// Snapshot-cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SnapshotStats {
    /// Stored snapshots.
    pub entries: u64,
    /// Snapshot hits.
    pub hits: u64,
    /// Snapshot misses.
    pub misses: u64,
    /// Snapshot writes.
    pub sets: u64,
}

/// Storage statistics, as exposed by `stats()`.
#[derive(Debug, Clone, Copy, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct StorageStats {
    /// Selector records.
    pub selectors: u64,
    /// Input mappings.
    pub total_mappings: u64,
    /// Enhanced keys.
    pub enhanced_keys: u64,
    /// Database size in bytes.
    pub db_size_bytes: u64,
}

/// Aggregate statistics for the whole cache.
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CacheStatsSnapshot {
    /// Durable-tier hits by level.
    pub hits: HitCounts,
    /// Lookups that missed every level.
    pub misses: u64,
    /// Successful writes.
    pub sets: u64,
    /// Pattern mappings learned in the background.
    pub learnings: u64,
    /// Rows copied by schema migration.
    pub migrations: u64,
    /// Explicit selector invalidations.
    pub invalidations: u64,
    /// Hit rate across both tiers.
    pub hit_rate: f64,
    /// Storage errors absorbed by this tier.
    pub storage_errors: u64,
    /// Memory tier.
    pub memory: MemoryStats,
    /// Durable storage.
    pub storage: StorageStats,
    /// Snapshot cache.
    pub snapshots: SnapshotStats,
}

/// Result of `health()`.
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CacheHealth {
    /// Whether every probe passed.
    pub ok: bool,
    /// Human-readable problems found.
    pub issues: Vec<String>,
}

/// Outcome of a wrapped selector operation.
#[derive(Debug, Clone)]
pub struct WrappedOutcome<T> {
    /// What the operation returned.
    pub result: T,
    /// Whether the winning selector came from the cache.
    pub cached: bool,
    /// The selector that worked.
    pub selector: String,
    /// Wall time of the whole wrapped call.
    pub duration: Duration,
}

/// Error type the caller-supplied operation reports.
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

/// The tiered selector cache. Construct one per process, share it behind an
/// `Arc`, close it explicitly.
#[derive(Debug)]
pub struct TieredSelectorCache {
    memory: MemoryCache,
    inner: BidirectionalCache,
    storage_errors: AtomicU64,
}

impl TieredSelectorCache {
    /// Open the cache with the given configuration.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        let preload = config.preload_common_selectors;
        let memory = MemoryCache::new(
            config.memory_size,
            Duration::from_millis(config.memory_ttl_ms),
        );
        let inner = BidirectionalCache::open(config).await?;
        let cache = Self {
            memory,
            inner,
            storage_errors: AtomicU64::new(0),
        };
        if preload {
            cache.preload().await;
        }
        Ok(cache)
    }

    /// Warm the LRU with the most used stored mappings.
    async fn preload(&self) {
        match self.inner.store().top_mappings(PRELOAD_LIMIT).await {
            Ok(rows) => {
                for row in rows {
                    let key = memory_key(&row.input, &row.url);
                    self.memory
                        .insert(
                            key,
                            CacheHit {
                                selector: row.selector,
                                confidence: row.confidence,
                                source: HitSource::Exact,
                                cached: true,
                            },
                        )
                        .await;
                }
            }
            Err(e) => log::debug!("preload skipped: {}", e),
        }
    }

    /// Look up a selector for a description on a URL.
    ///
    /// Storage trouble is absorbed: the caller sees a miss, the error is
    /// logged and counted.
    pub async fn get(&self, input: &str, url: &str) -> CacheResult<Option<CacheHit>> {
        let key = memory_key(input, url);
        if let Some(hit) = self.memory.get(&key).await {
            return Ok(Some(hit));
        }

        match self.inner.get(input, url).await {
            Ok(Some(hit)) => {
                self.populate_memory(input, url, &hit).await;
                Ok(Some(hit))
            }
            Ok(None) => Ok(None),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(None)
            }
        }
    }

    /// Record a successful resolution through both tiers.
    pub async fn set(&self, input: &str, url: &str, selector: &str) -> CacheResult<()> {
        match self.inner.set(input, url, selector).await {
            Ok(()) => {}
            Err(CacheError::Closed) => return Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                return Ok(());
            }
        }

        // memoize with the stored confidence
        let hit = match self.inner.store().lookup_exact(input, url).await {
            Ok(Some(row)) => CacheHit {
                selector: row.selector,
                confidence: row.confidence,
                source: HitSource::Exact,
                cached: true,
            },
            _ => CacheHit {
                selector: selector.to_string(),
                confidence: 0.8,
                source: HitSource::Exact,
                cached: true,
            },
        };
        self.populate_memory(input, url, &hit).await;
        Ok(())
    }

    /// Memoize a hit and pre-insert cheap input variations at a discount.
    async fn populate_memory(&self, input: &str, url: &str, hit: &CacheHit) {
        self.memory.insert(memory_key(input, url), hit.clone()).await;

        let discounted = CacheHit {
            selector: hit.selector.clone(),
            confidence: hit.confidence * self.inner.config().variation_confidence_discount,
            source: HitSource::Normalized,
            cached: true,
        };
        for variation in input_variations(input) {
            let key = memory_key(&variation, url);
            self.memory.insert(key, discounted.clone()).await;
        }
    }

    /// Drop every memory entry scoped to a URL (navigation invalidation).
    pub async fn invalidate_for_url(&self, url: &str) {
        self.memory.remove_url(url).await;
    }

    /// Invalidate a selector on a URL in both tiers.
    pub async fn invalidate_selector(&self, selector: &str, url: &str) -> CacheResult<u64> {
        self.memory.remove_selector(selector, url).await;
        match self.inner.invalidate_selector(selector, url).await {
            Ok(n) => Ok(n),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(0)
            }
        }
    }

    /// Run a browser operation through the cache with self-healing.
    ///
    /// The cached selector is tried first; on failure it is invalidated in
    /// both tiers and the generated fallback ladder runs. The first
    /// selector that works is recorded. Every attempt is bounded by
    /// `timeout`. Nothing is recorded unless a selector actually worked.
    pub async fn wrap_selector_operation<T, F, Fut>(
        &self,
        description: &str,
        url: &str,
        operation: F,
        fallback: Option<&str>,
        timeout: Duration,
    ) -> CacheResult<WrappedOutcome<T>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let started = Instant::now();
        let mut attempts = 0usize;
        let mut last_error = String::new();
        let mut failed_cached: Option<String> = None;

        if let Some(hit) = self.get(description, url).await? {
            attempts += 1;
            match attempt(&operation, &hit.selector, timeout).await {
                Ok(result) => {
                    // reinforce the mapping that just proved itself
                    let _ = self.set(description, url, &hit.selector).await;
                    return Ok(WrappedOutcome {
                        result,
                        cached: true,
                        selector: hit.selector,
                        duration: started.elapsed(),
                    });
                }
                Err(message) => {
                    log::debug!(
                        "cached selector {} failed for {:?}: {}",
                        hit.selector,
                        description,
                        message
                    );
                    self.memory.remove(&memory_key(description, url)).await;
                    let _ = self.invalidate_selector(&hit.selector, url).await;
                    last_error = message;
                    failed_cached = Some(hit.selector);
                }
            }
        }

        for candidate in universal_fallbacks(description, fallback) {
            if failed_cached.as_deref() == Some(candidate.as_str()) {
                continue;
            }
            attempts += 1;
            match attempt(&operation, &candidate, timeout).await {
                Ok(result) => {
                    let _ = self.set(description, url, &candidate).await;
                    return Ok(WrappedOutcome {
                        result,
                        cached: false,
                        selector: candidate,
                        duration: started.elapsed(),
                    });
                }
                Err(message) => last_error = message,
            }
        }

        Err(CacheError::OperationFailed {
            attempts,
            message: last_error,
        })
    }

    /// Cross-environment lookup through the enhanced key space.
    pub async fn get_enhanced(
        &self,
        test_name: &str,
        url: &str,
        steps: &[TestStep],
        profile: &str,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<Option<CacheHit>> {
        match self.inner.get_enhanced(test_name, url, steps, profile, page).await {
            Ok(hit) => Ok(hit),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(None)
            }
        }
    }

    /// Store a selector under an enhanced cross-environment key.
    pub async fn set_enhanced(
        &self,
        test_name: &str,
        url: &str,
        steps: &[TestStep],
        profile: &str,
        selector: &str,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<()> {
        match self
            .inner
            .set_enhanced(test_name, url, steps, profile, selector, page)
            .await
        {
            Ok(()) => Ok(()),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(())
            }
        }
    }

    /// Retrieve a page snapshot.
    pub async fn get_snapshot(
        &self,
        cache_key: &str,
        profile: &str,
        options: SnapshotGetOptions,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<Option<SnapshotPayload>> {
        match self.inner.get_snapshot(cache_key, profile, options, page).await {
            Ok(payload) => Ok(payload),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(None)
            }
        }
    }

    /// Store a page snapshot.
    pub async fn set_snapshot(
        &self,
        cache_key: &str,
        payload: &SnapshotPayload,
        options: SnapshotSetOptions,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<()> {
        match self.inner.set_snapshot(cache_key, payload, options, page).await {
            Ok(()) => Ok(()),
            Err(CacheError::Closed) => Err(CacheError::Closed),
            Err(e) => {
                self.absorb(&e);
                Ok(())
            }
        }
    }

    /// Export every stored mapping on a URL.
    pub async fn export_mappings(&self, url: &str) -> CacheResult<Vec<MappingExport>> {
        match self.inner.store().export_mappings(url).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                self.absorb(&e);
                Ok(Vec::new())
            }
        }
    }

    /// Import mappings, e.g. ones exported from another environment. The
    /// variation cap applies on the next sweep.
    pub async fn import_mappings(&self, mappings: &[MappingExport]) -> CacheResult<u64> {
        let mut imported = 0;
        for m in mappings {
            let normalized = normalize(&m.input);
            let write = crate::store::SuccessWrite {
                input: &m.input,
                normalized: &normalized,
                url: &m.url,
                selector: &m.selector,
                dom_signature: None,
                learned_from: m.learned_from,
                initial_confidence: m.confidence,
                selector_boost: 1.0,
                mapping_boost: 1.0,
            };
            match self.inner.store().record_success(write).await {
                Ok(_) => imported += 1,
                Err(e) => self.absorb(&e),
            }
        }
        Ok(imported)
    }

    /// Aggregate statistics across both tiers.
    pub async fn stats(&self) -> CacheStatsSnapshot {
        let ladder = self.inner.stats();
        let counts = match self.inner.store().counts().await {
            Ok(c) => c,
            Err(e) => {
                self.absorb(&e);
                StorageCounts::default()
            }
        };
        let migrations = self.inner.store().migrated_count().await.unwrap_or(0);

        let memory = MemoryStats {
            entries: self.memory.len().await as u64,
            hits: self.memory.counters.hits.load(Ordering::Relaxed),
            misses: self.memory.counters.misses.load(Ordering::Relaxed),
            evictions: self.memory.counters.evictions.load(Ordering::Relaxed),
            expirations: self.memory.counters.expirations.load(Ordering::Relaxed),
        };

        let ladder_hits =
            ladder.exact + ladder.normalized + ladder.reverse + ladder.fuzzy + ladder.enhanced;
        let total_hits = memory.hits + ladder_hits;
        let total_lookups = total_hits + ladder.misses;
        let hit_rate = if total_lookups > 0 {
            total_hits as f64 / total_lookups as f64
        } else {
            0.0
        };

        CacheStatsSnapshot {
            hits: HitCounts {
                exact: ladder.exact,
                normalized: ladder.normalized,
                reverse: ladder.reverse,
                fuzzy: ladder.fuzzy,
                enhanced: ladder.enhanced,
            },
            misses: ladder.misses,
            sets: ladder.sets,
            learnings: ladder.learnings,
            migrations,
            invalidations: ladder.invalidations,
            hit_rate,
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            memory,
            storage: StorageStats {
                selectors: counts.selectors,
                total_mappings: counts.mappings,
                enhanced_keys: counts.enhanced_keys,
                db_size_bytes: counts.db_size_bytes,
            },
            snapshots: SnapshotStats {
                entries: counts.snapshots,
                hits: ladder.snapshot_hits,
                misses: ladder.snapshot_misses,
                sets: ladder.snapshot_sets,
            },
        }
    }

    /// Probe the cache for problems. Never fails; problems become issues.
    pub async fn health(&self) -> CacheHealth {
        let mut issues = Vec::new();

        match self.inner.store().counts().await {
            Ok(counts) => {
                let limit = self.inner.config().max_size_mb * 1024 * 1024;
                if counts.db_size_bytes > limit {
                    issues.push(format!(
                        "database size {} bytes exceeds advisory limit of {} MB",
                        counts.db_size_bytes,
                        self.inner.config().max_size_mb
                    ));
                }
            }
            Err(e) => issues.push(format!("storage unreachable: {}", e)),
        }

        match self.inner.store().orphan_mapping_count().await {
            Ok(0) => {}
            Ok(n) => issues.push(format!("{} orphaned mappings await the next sweep", n)),
            Err(e) => issues.push(format!("orphan probe failed: {}", e)),
        }

        if self.inner.store().is_closed() {
            issues.push("store is closed".to_string());
        }

        CacheHealth {
            ok: issues.is_empty(),
            issues,
        }
    }

    /// Run one sweep pass immediately.
    pub async fn sweep_now(&self) -> CacheResult<crate::store::SweepOutcome> {
        self.inner.sweep_now().await
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) -> CacheResult<()> {
        self.memory.clear().await;
        self.inner.clear().await
    }

    /// Cancel background work and close the store. Idempotent.
    pub async fn close(&self) -> CacheResult<()> {
        self.memory.clear().await;
        self.inner.close().await
    }

    fn absorb(&self, error: &CacheError) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("absorbed storage error: {}", error);
    }
}

/// Memory-tier key: lowercased trimmed input, a pipe, the URL.
fn memory_key(input: &str, url: &str) -> String {
    format!("{}|{}", input.trim().to_lowercase(), url)
}

/// Cheap variations of an input worth pre-caching: lowercased, de-articled,
/// action-synonym substituted, "button" suffix stripped.
fn input_variations(input: &str) -> Vec<String> {
    let base = input.trim().to_lowercase();
    if base.is_empty() {
        return Vec::new();
    }

    let mut variations: Vec<String> = Vec::with_capacity(MAX_VARIATIONS + 2);

    let de_articled: String = base
        .split_whitespace()
        .filter(|w| !matches!(*w, "the" | "a" | "an"))
        .collect::<Vec<_>>()
        .join(" ");
    if !de_articled.is_empty() {
        variations.push(de_articled);
    }

    if let Some(stripped) = base.strip_suffix(" button") {
        variations.push(stripped.to_string());
    }

    let words: Vec<&str> = base.split_whitespace().collect();
    'outer: for (i, word) in words.iter().enumerate() {
        if let Some(synonyms) = action_synonyms(word) {
            for &synonym in synonyms {
                if synonym == *word {
                    continue;
                }
                let mut swapped = words.clone();
                swapped[i] = synonym;
                variations.push(swapped.join(" "));
                if variations.len() >= MAX_VARIATIONS + 2 {
                    break 'outer;
                }
            }
            break;
        }
    }

    let mut seen = hashbrown::HashSet::with_capacity(variations.len() + 1);
    seen.insert(base);
    variations
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .take(MAX_VARIATIONS)
        .collect()
}

/// Run one attempt of the caller-supplied operation under the timeout.
async fn attempt<T, F, Fut>(operation: &F, selector: &str, timeout: Duration) -> Result<T, String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    match tokio::time::timeout(timeout, operation(selector.to_string())).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {} ms", timeout.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_cache() -> (TempDir, TieredSelectorCache) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = CacheConfig::new().with_cache_dir(dir.path());
        config.preload_common_selectors = false;
        let cache = TieredSelectorCache::open(config).await.expect("open");
        (dir, cache)
    }

    #[test]
    fn test_memory_key_shape() {
        assert_eq!(memory_key("  Click Login  ", "https://a/"), "click login|https://a/");
    }

    #[test]
    fn test_input_variations() {
        let variations = input_variations("Click the Login Button");
        assert!(variations.contains(&"click login button".to_string()));
        assert!(variations.contains(&"click the login".to_string()));
        assert!(variations.contains(&"press the login button".to_string()));
        assert!(variations.len() <= MAX_VARIATIONS);
        // the plain lowercased form is the primary key, not a variation
        assert!(!variations.contains(&"click the login button".to_string()));
    }

    #[test]
    fn test_input_variations_empty() {
        assert!(input_variations("   ").is_empty());
    }

    #[tokio::test]
    async fn test_set_then_memory_hit() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#login").await.expect("set");

        let hit = cache
            .get("click login", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Exact);

        let stats = cache.stats().await;
        assert_eq!(stats.memory.hits, 1);
        // the durable ladder never ran
        assert_eq!(stats.hits.exact, 0);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_variation_pre_caching() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("click the login button", "https://a/", "#login")
            .await
            .expect("set");

        // a pre-cached variation answers from memory at a discount
        let hit = cache
            .get("press the login button", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Normalized);

        let direct = cache
            .get("click the login button", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert!(hit.confidence < direct.confidence);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_invalidate_for_url_drops_memory() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#login").await.expect("set");
        cache.set("click save", "https://b/", "#save").await.expect("set");

        cache.invalidate_for_url("https://a/").await;

        // a falls through to the durable tier, b still answers from memory
        let stats_before = cache.stats().await;
        let _ = cache.get("click login", "https://a/").await.expect("get");
        let _ = cache.get("click save", "https://b/").await.expect("get");
        let stats_after = cache.stats().await;
        assert_eq!(stats_after.hits.exact, stats_before.hits.exact + 1);
        assert_eq!(stats_after.memory.hits, stats_before.memory.hits + 1);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_wrap_operation_cached_success() {
        let (_dir, cache) = open_cache().await;
        cache.set("save", "https://a/", "btn.save").await.expect("set");

        let outcome = cache
            .wrap_selector_operation(
                "save",
                "https://a/",
                |selector| async move {
                    if selector == "btn.save" {
                        Ok::<_, OperationError>("clicked")
                    } else {
                        Err("no such element".into())
                    }
                },
                None,
                Duration::from_secs(1),
            )
            .await
            .expect("wrapped operation");

        assert!(outcome.cached);
        assert_eq!(outcome.selector, "btn.save");
        assert_eq!(outcome.result, "clicked");
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_wrap_operation_self_heals() {
        let (_dir, cache) = open_cache().await;
        cache.set("save", "https://a/", "btn.old").await.expect("set");

        let outcome = cache
            .wrap_selector_operation(
                "save",
                "https://a/",
                |selector| async move {
                    if selector == "text=\"save\"" {
                        Ok::<_, OperationError>(())
                    } else {
                        Err("stale selector".into())
                    }
                },
                None,
                Duration::from_secs(1),
            )
            .await
            .expect("wrapped operation");

        assert!(!outcome.cached);
        assert_eq!(outcome.selector, "text=\"save\"");

        // the failed selector is gone, the healed one is cached
        let hit = cache
            .get("save", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "text=\"save\"");
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_wrap_operation_exhausts_fallbacks() {
        let (_dir, cache) = open_cache().await;

        let err = cache
            .wrap_selector_operation(
                "save",
                "https://a/",
                |_selector| async move { Err::<(), _>(OperationError::from("nothing matches")) },
                None,
                Duration::from_secs(1),
            )
            .await
            .expect_err("must fail");

        match err {
            CacheError::OperationFailed { attempts, message } => {
                assert!(attempts > 1);
                assert_eq!(message, "nothing matches");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // nothing was recorded for the failing description
        assert!(cache.get("save", "https://a/").await.expect("get").is_none());
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_wrap_operation_timeout_counts_as_failure() {
        let (_dir, cache) = open_cache().await;
        cache.set("save", "https://a/", "btn.slow").await.expect("set");

        let outcome = cache
            .wrap_selector_operation(
                "save",
                "https://a/",
                |selector| async move {
                    if selector == "btn.slow" {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, OperationError>(())
                    } else if selector == "text=\"save\"" {
                        Ok(())
                    } else {
                        Err("no".into())
                    }
                },
                None,
                Duration::from_millis(50),
            )
            .await
            .expect("wrapped operation");

        assert!(!outcome.cached);
        assert_eq!(outcome.selector, "text=\"save\"");
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#login").await.expect("set");
        cache.clear().await.expect("clear");

        let stats = cache.stats().await;
        assert_eq!(stats.storage.total_mappings, 0);
        assert_eq!(stats.memory.entries, 0);
        assert!(cache
            .get("click login", "https://a/")
            .await
            .expect("get")
            .is_none());
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_health_ok() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#login").await.expect("set");
        let health = cache.health().await;
        assert!(health.ok, "issues: {:?}", health.issues);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_preload_warms_memory() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = CacheConfig::new().with_cache_dir(dir.path());
        config.preload_common_selectors = false;
        let cache = TieredSelectorCache::open(config.clone()).await.expect("open");
        cache.set("click login", "https://a/", "#login").await.expect("set");
        cache.close().await.expect("close");

        config.preload_common_selectors = true;
        let warmed = TieredSelectorCache::open(config).await.expect("reopen");
        let hit = warmed
            .get("click login", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");
        let stats = warmed.stats().await;
        assert_eq!(stats.memory.hits, 1, "preloaded entry must answer from memory");
        warmed.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#login").await.expect("set");
        cache.set("click save", "https://a/", "#save").await.expect("set");

        let exported = cache.export_mappings("https://a/").await.expect("export");
        assert_eq!(exported.len(), 2);

        let (_dir2, other) = open_cache().await;
        let imported = other.import_mappings(&exported).await.expect("import");
        assert_eq!(imported, 2);
        let hit = other
            .get("click login", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");

        cache.close().await.expect("close");
        other.close().await.expect("close");
    }
}
