//! The bidirectional cache: lookup ladder, learning and invalidation.
//!
//! Lookups walk a four-level ladder (exact → normalized → reverse → fuzzy)
//! against the store and report which level answered. Writes reinforce both
//! the selector record and the input mapping in one transaction, then hand
//! the input to a background worker that learns related phrasings
//! best-effort. A periodic sweep applies TTLs, the variation cap and orphan
//! collection.

use crate::configuration::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::keys::{EnhancedKey, TestStep};
use crate::normalize::{damerau_levenshtein, normalize, NormalizedInput};
use crate::signature::{DomSignature, SignatureManager, SnapshotProvider};
use crate::similarity::{token_similarity, Operation, SimilarityContext, CONFLICT};
use crate::snapshot::{SnapshotGetOptions, SnapshotPayload, SnapshotSetOptions};
use crate::store::{LearnedFrom, SnapshotRow, Store, SuccessWrite};
use crate::now_ms;
use hashbrown::HashSet;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Confidence a brand-new direct mapping starts at.
const INITIAL_MAPPING_CONFIDENCE: f64 = 0.8;
/// Confidence a brand-new enhanced key starts at.
const INITIAL_ENHANCED_CONFIDENCE: f64 = 0.8;
/// How many candidate rows a reverse or fuzzy pass examines.
const CANDIDATE_SCAN_LIMIT: i64 = 200;
/// How many enhanced rows a near-match pass examines.
const ENHANCED_SCAN_LIMIT: i64 = 50;
/// Sibling mappings examined per learning request.
const LEARN_SIBLING_LIMIT: i64 = 5;
/// Capacity of the learning queue; overflow is dropped.
const LEARN_QUEUE_CAPACITY: usize = 64;
/// Window for fuzzy candidates.
const FUZZY_WINDOW_MS: i64 = 3_600_000;

/// Which ladder level answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    /// Raw input and URL matched a stored mapping.
    Exact,
    /// The normalized input matched.
    Normalized,
    /// Context-aware similarity against stored phrasings matched.
    Reverse,
    /// Edit distance against recent phrasings matched.
    Fuzzy,
    /// An enhanced key near-match resolved it.
    Enhanced,
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CacheHit {
    /// The proven selector.
    pub selector: String,
    /// Confidence after any level penalty.
    pub confidence: f64,
    /// Level that answered.
    pub source: HitSource,
    /// Whether the answer came from the cache (always true here; the
    /// operation wrapper sets it false for freshly discovered selectors).
    pub cached: bool,
}

/// Ladder and write counters.
#[derive(Debug, Default)]
pub(crate) struct LadderStats {
    pub exact: AtomicU64,
    pub normalized: AtomicU64,
    pub reverse: AtomicU64,
    pub fuzzy: AtomicU64,
    pub enhanced: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub learnings: AtomicU64,
    pub invalidations: AtomicU64,
    pub snapshot_hits: AtomicU64,
    pub snapshot_misses: AtomicU64,
    pub snapshot_sets: AtomicU64,
}

/// Point-in-time view of the ladder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct LadderStatsSnapshot {
    /// Exact-level hits.
    pub exact: u64,
    /// Normalized-level hits.
    pub normalized: u64,
    /// Reverse-level hits.
    pub reverse: u64,
    /// Fuzzy-level hits (including DOM-augmented ones).
    pub fuzzy: u64,
    /// Enhanced-key hits.
    pub enhanced: u64,
    /// Lookups that missed every level.
    pub misses: u64,
    /// Successful writes.
    pub sets: u64,
    /// Pattern mappings learned in the background.
    pub learnings: u64,
    /// Explicit selector invalidations.
    pub invalidations: u64,
    /// Snapshot hits.
    pub snapshot_hits: u64,
    /// Snapshot misses.
    pub snapshot_misses: u64,
    /// Snapshot writes.
    pub snapshot_sets: u64,
}

impl LadderStats {
    fn snapshot(&self) -> LadderStatsSnapshot {
        LadderStatsSnapshot {
            exact: self.exact.load(Ordering::Relaxed),
            normalized: self.normalized.load(Ordering::Relaxed),
            reverse: self.reverse.load(Ordering::Relaxed),
            fuzzy: self.fuzzy.load(Ordering::Relaxed),
            enhanced: self.enhanced.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            learnings: self.learnings.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            snapshot_hits: self.snapshot_hits.load(Ordering::Relaxed),
            snapshot_misses: self.snapshot_misses.load(Ordering::Relaxed),
            snapshot_sets: self.snapshot_sets.load(Ordering::Relaxed),
        }
    }
}

/// Work item for the background learning worker.
struct LearnRequest {
    selector_hash: String,
    selector: String,
    url: String,
    normalized: String,
    tokens: Vec<String>,
}

/// The durable bidirectional cache. Callers normally reach it through
/// [`TieredSelectorCache`](crate::TieredSelectorCache).
#[derive(Debug)]
pub struct BidirectionalCache {
    store: Store,
    config: CacheConfig,
    stats: Arc<LadderStats>,
    signatures: SignatureManager,
    learn_tx: mpsc::Sender<LearnRequest>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BidirectionalCache {
    /// Open the cache, spawning the learning worker and the periodic sweep.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let store = Store::open(&config.db_path()).await?;
        Self::with_store(store, config)
    }

    /// Wire an already-open store. Used by `open` and by tests that need a
    /// specific path.
    pub(crate) fn with_store(store: Store, config: CacheConfig) -> CacheResult<Self> {
        let stats = Arc::new(LadderStats::default());
        let (learn_tx, learn_rx) = mpsc::channel(LEARN_QUEUE_CAPACITY);

        let worker = tokio::spawn(learn_loop(store.clone(), Arc::clone(&stats), learn_rx));

        let sweeper = tokio::spawn(sweep_loop(store.clone(), config.clone()));

        Ok(Self {
            store,
            config,
            stats,
            signatures: SignatureManager::new(),
            learn_tx,
            worker: Mutex::new(Some(worker)),
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Look up a selector for a description on a URL.
    pub async fn get(&self, input: &str, url: &str) -> CacheResult<Option<CacheHit>> {
        self.ensure_open()?;
        match self.lookup_ladder(input, url).await? {
            Some(hit) => Ok(Some(hit)),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Look up with DOM-signature assistance: on a ladder miss, score
    /// recent candidates by signature and input similarity against the
    /// live page. Degrades to the plain ladder without a page.
    pub async fn get_with_page(
        &self,
        input: &str,
        url: &str,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<Option<CacheHit>> {
        self.ensure_open()?;
        if let Some(hit) = self.lookup_ladder(input, url).await? {
            return Ok(Some(hit));
        }
        if let Some(page) = page {
            if let Some(hit) = self.dom_augmented_lookup(input, url, page).await? {
                self.stats.fuzzy.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(hit));
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn lookup_ladder(&self, input: &str, url: &str) -> CacheResult<Option<CacheHit>> {
        // level 1: exact raw input
        if let Some(row) = self.store.lookup_exact(input, url).await? {
            self.stats.exact.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(CacheHit {
                selector: row.selector,
                confidence: row.confidence,
                source: HitSource::Exact,
                cached: true,
            }));
        }

        let query = normalize(input);
        if query.is_empty() {
            return Ok(None);
        }

        // level 2: normalized input
        if let Some(row) = self.store.lookup_normalized(&query.normalized, url).await? {
            self.stats.normalized.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(CacheHit {
                selector: row.selector,
                confidence: row.confidence,
                source: HitSource::Normalized,
                cached: true,
            }));
        }

        // level 3: reverse similarity over stored phrasings
        if let Some(hit) = self.reverse_lookup(&query, url).await? {
            self.stats.reverse.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit));
        }

        // level 4: edit distance over the last hour
        if let Some(hit) = self.fuzzy_lookup(&query, url).await? {
            self.stats.fuzzy.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit));
        }

        Ok(None)
    }

    async fn reverse_lookup(
        &self,
        query: &NormalizedInput,
        url: &str,
    ) -> CacheResult<Option<CacheHit>> {
        let candidates = self.store.candidates_for_url(url, CANDIDATE_SCAN_LIMIT).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        // acceptance runs at the test-search bar: weaker overlaps are left
        // for the fuzzy level, which bounds them by edit distance instead
        let ctx = SimilarityContext {
            url: Some(url),
            profile: None,
            domain_match: true,
            operation: Operation::TestSearch,
        };
        let threshold = Operation::TestSearch.threshold();

        let mut best: Option<(f64, &crate::store::CandidateRow)> = None;
        for candidate in &candidates {
            let sim = token_similarity(&query.tokens, &candidate.tokens, &ctx);
            if sim == CONFLICT {
                // conflicting actions never match, whatever the overlap
                continue;
            }
            let score = sim
                * (1.0 + (1.0 + candidate.success_count as f64).ln() * 0.1)
                * candidate.confidence;
            if score > threshold && best.map_or(true, |(b, _)| score > b) {
                best = Some((score, candidate));
            }
        }

        Ok(best.map(|(_, candidate)| CacheHit {
            selector: candidate.selector.clone(),
            confidence: candidate.confidence * self.config.reverse_confidence_penalty,
            source: HitSource::Reverse,
            cached: true,
        }))
    }

    async fn fuzzy_lookup(
        &self,
        query: &NormalizedInput,
        url: &str,
    ) -> CacheResult<Option<CacheHit>> {
        let max_distance = query.normalized.chars().count() / 8;
        if max_distance == 0 {
            return Ok(None);
        }

        let since = now_ms() - FUZZY_WINDOW_MS;
        let candidates = self
            .store
            .recent_candidates(url, since, CANDIDATE_SCAN_LIMIT)
            .await?;

        let mut best: Option<(usize, &crate::store::CandidateRow)> = None;
        for candidate in &candidates {
            let distance = damerau_levenshtein(&query.normalized, &candidate.normalized_input);
            if distance > 0
                && distance <= max_distance
                && best.map_or(true, |(b, _)| distance < b)
            {
                best = Some((distance, candidate));
            }
        }

        Ok(best.map(|(distance, candidate)| CacheHit {
            selector: candidate.selector.clone(),
            confidence: candidate.confidence * (1.0 - distance as f64 / 10.0),
            source: HitSource::Fuzzy,
            cached: true,
        }))
    }

    async fn dom_augmented_lookup(
        &self,
        input: &str,
        url: &str,
        page: &dyn SnapshotProvider,
    ) -> CacheResult<Option<CacheHit>> {
        let current = match self.signatures.capture(page, url).await {
            Some(sig) => sig,
            None => return Ok(None),
        };

        let query = normalize(input);
        let since = now_ms() - FUZZY_WINDOW_MS;
        let candidates = self
            .store
            .recent_candidates(url, since, CANDIDATE_SCAN_LIMIT)
            .await?;

        let ctx = SimilarityContext {
            url: Some(url),
            profile: None,
            domain_match: true,
            operation: Operation::CrossEnv,
        };
        let threshold = Operation::CrossEnv.threshold();

        let mut best: Option<(f64, &crate::store::CandidateRow)> = None;
        for candidate in &candidates {
            let sig_sim = candidate
                .selector_signature
                .as_deref()
                .and_then(|s| DomSignature::similarity_str(&current, s))
                .unwrap_or(0.0);
            let input_sim = match token_similarity(&query.tokens, &candidate.tokens, &ctx) {
                s if s == CONFLICT => continue,
                s => s,
            };
            let score = self.config.dom_signature_weight * sig_sim
                + self.config.input_similarity_weight * input_sim;
            if score >= threshold && best.map_or(true, |(b, _)| score > b) {
                best = Some((score, candidate));
            }
        }

        Ok(best.map(|(score, candidate)| CacheHit {
            selector: candidate.selector.clone(),
            confidence: candidate.confidence * score,
            source: HitSource::Fuzzy,
            cached: true,
        }))
    }

    /// Record a successful resolution and queue related-pattern learning.
    pub async fn set(&self, input: &str, url: &str, selector: &str) -> CacheResult<()> {
        self.set_with_page(input, url, selector, None).await
    }

    /// Record a successful resolution, stamping the selector with the
    /// page's DOM signature when a page accessor is available.
    pub async fn set_with_page(
        &self,
        input: &str,
        url: &str,
        selector: &str,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<()> {
        self.ensure_open()?;
        let dom_signature = match page {
            Some(p) => self.signatures.capture(p, url).await,
            None => None,
        };

        let normalized = normalize(input);
        let hash = self
            .store
            .record_success(SuccessWrite {
                input,
                normalized: &normalized,
                url,
                selector,
                dom_signature: dom_signature.as_deref(),
                learned_from: LearnedFrom::Direct,
                initial_confidence: INITIAL_MAPPING_CONFIDENCE,
                selector_boost: self.config.selector_confidence_boost,
                mapping_boost: self.config.mapping_confidence_boost,
            })
            .await?;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);

        // best-effort: a full queue drops the request
        let _ = self.learn_tx.try_send(LearnRequest {
            selector_hash: hash,
            selector: selector.to_string(),
            url: url.to_string(),
            normalized: normalized.normalized,
            tokens: normalized.tokens.to_vec(),
        });

        Ok(())
    }

    /// Drop every mapping of a selector on a URL; an unreferenced selector
    /// record goes with them. Returns the number of mappings removed.
    pub async fn invalidate_selector(&self, selector: &str, url: &str) -> CacheResult<u64> {
        self.ensure_open()?;
        let removed = self.store.invalidate_selector(selector, url).await?;
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(removed)
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
        self.ensure_open()?;
        let dom_signature = match page {
            Some(p) => self.signatures.capture(p, url).await,
            None => None,
        };
        let key = EnhancedKey::new(test_name, url, steps, dom_signature, profile);
        self.store
            .upsert_enhanced(&key, selector, INITIAL_ENHANCED_CONFIDENCE, None)
            .await?;
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolve through the enhanced key space: exact identity first, then
    /// near-matches by weighted key similarity, then the legacy ladder.
    pub async fn get_enhanced(
        &self,
        test_name: &str,
        url: &str,
        steps: &[TestStep],
        profile: &str,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<Option<CacheHit>> {
        self.ensure_open()?;
        let dom_signature = match page {
            Some(p) => self.signatures.capture(p, url).await,
            None => None,
        };
        let key = EnhancedKey::new(test_name, url, steps, dom_signature, profile);

        if let Some(row) = self.store.enhanced_by_hash(&key.base_key_hash()).await? {
            let similarity = row
                .key
                .as_ref()
                .map(|stored| key.similarity(stored))
                .unwrap_or(1.0);
            self.stats.enhanced.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(CacheHit {
                selector: row.selector,
                confidence: (row.confidence * similarity).min(1.0),
                source: HitSource::Exact,
                cached: true,
            }));
        }

        let candidates = self
            .store
            .enhanced_candidates(&key.url_pattern, &key.profile, ENHANCED_SCAN_LIMIT)
            .await?;
        let mut best: Option<(f64, &crate::store::EnhancedRow)> = None;
        for candidate in &candidates {
            let stored = match &candidate.key {
                Some(k) => k,
                None => continue,
            };
            let sim = key.similarity(stored);
            if sim >= self.config.enhanced_accept_threshold
                && best.map_or(true, |(b, _)| sim > b)
            {
                best = Some((sim, candidate));
            }
        }
        if let Some((sim, row)) = best {
            self.stats.enhanced.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(CacheHit {
                selector: row.selector.clone(),
                confidence: (row.confidence * sim).min(1.0),
                source: HitSource::Enhanced,
                cached: true,
            }));
        }

        // compatibility read path
        match self.lookup_ladder(test_name, url).await? {
            Some(hit) => Ok(Some(hit)),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
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
        self.ensure_open()?;
        let url = options.url.unwrap_or_default();
        let dom_signature = match page {
            Some(p) if !url.is_empty() => self.signatures.capture(p, &url).await,
            _ => None,
        };
        let (viewport_w, viewport_h) = options
            .viewport
            .map(|v| (v.width as i64, v.height as i64))
            .unwrap_or((0, 0));

        self.store
            .put_snapshot(&SnapshotRow {
                cache_key: cache_key.to_string(),
                url,
                dom_hash: options.dom_hash.unwrap_or_default(),
                data: payload.encode(),
                viewport_w,
                viewport_h,
                profile: options.profile.unwrap_or_else(|| "default".to_string()),
                created_at: now_ms(),
                ttl: options.ttl_ms.unwrap_or(self.config.snapshot_ttl_ms) as i64,
                hit_count: 0,
                dom_signature,
            })
            .await?;
        self.stats.snapshot_sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retrieve a snapshot by key, optionally falling back to the closest
    /// DOM-signature match on the same URL and profile.
    pub async fn get_snapshot(
        &self,
        cache_key: &str,
        profile: &str,
        options: SnapshotGetOptions,
        page: Option<&dyn SnapshotProvider>,
    ) -> CacheResult<Option<SnapshotPayload>> {
        self.ensure_open()?;
        if let Some(row) = self.store.get_snapshot(cache_key, profile).await? {
            match SnapshotPayload::decode(&row.data) {
                Some(payload) => {
                    self.stats.snapshot_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(payload));
                }
                None => log::warn!("stored snapshot {} is malformed, skipping", cache_key),
            }
        }

        if options.dom_signature_fallback {
            if let Some(url) = options.url.as_deref() {
                let current = match page {
                    Some(p) => self.signatures.capture(p, url).await,
                    None => self.signatures.recent_for(url),
                };
                if let Some(current) = current {
                    let candidates = self.store.snapshot_candidates(url, profile, 20).await?;
                    let mut best: Option<(f64, &SnapshotRow)> = None;
                    for row in &candidates {
                        let sim = row
                            .dom_signature
                            .as_deref()
                            .and_then(|s| DomSignature::similarity_str(&current, s))
                            .unwrap_or(0.0);
                        if sim >= self.config.dom_signature_threshold
                            && best.map_or(true, |(b, _)| sim > b)
                        {
                            best = Some((sim, row));
                        }
                    }
                    if let Some((_, row)) = best {
                        if let Some(payload) = SnapshotPayload::decode(&row.data) {
                            self.stats.snapshot_hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(Some(payload));
                        }
                    }
                }
            }
        }

        self.stats.snapshot_misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Run one sweep pass immediately.
    pub async fn sweep_now(&self) -> CacheResult<crate::store::SweepOutcome> {
        self.ensure_open()?;
        self.store
            .sweep(
                self.config.selector_ttl_ms as i64,
                self.config.max_variations_per_selector as i64,
            )
            .await
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LadderStatsSnapshot {
        self.stats.snapshot()
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Configuration the cache was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Delete every stored row.
    pub async fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.store.clear().await
    }

    /// Cancel background tasks, then close the store. Idempotent.
    pub async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // timers and workers stop before the handle goes away
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.store.close().await;
        Ok(())
    }
}

/// Background learning: when a fresh phrasing shares at least two tokens
/// with an established sibling mapping of the same selector, record the
/// shared phrase as a pattern mapping with overlap-ratio confidence.
async fn learn_loop(store: Store, stats: Arc<LadderStats>, mut rx: mpsc::Receiver<LearnRequest>) {
    while let Some(req) = rx.recv().await {
        let siblings = match store
            .sibling_mappings(&req.selector_hash, &req.url, &req.normalized, LEARN_SIBLING_LIMIT)
            .await
        {
            Ok(siblings) => siblings,
            Err(e) => {
                log::debug!("pattern learning skipped: {}", e);
                continue;
            }
        };

        for sibling in &siblings {
            let new_tokens: HashSet<&str> = req.tokens.iter().map(|t| t.as_str()).collect();
            let sibling_tokens: HashSet<&str> =
                sibling.tokens.iter().map(|t| t.as_str()).collect();
            let mut seen: HashSet<&str> = HashSet::new();
            let shared: SmallVec<[&str; 8]> = req
                .tokens
                .iter()
                .map(|t| t.as_str())
                .filter(|t| sibling_tokens.contains(t) && seen.insert(*t))
                .collect();

            if shared.len() < 2 {
                continue;
            }

            let union = new_tokens.len() + sibling_tokens.len() - shared.len();
            let overlap_ratio = shared.len() as f64 / union as f64;
            let synthetic = NormalizedInput {
                normalized: shared.join(" "),
                tokens: shared.iter().map(|t| t.to_string()).collect(),
            };

            let write = SuccessWrite {
                input: &synthetic.normalized,
                normalized: &synthetic,
                url: &req.url,
                selector: &req.selector,
                dom_signature: None,
                learned_from: LearnedFrom::Pattern,
                initial_confidence: overlap_ratio,
                selector_boost: 1.0,
                mapping_boost: 1.0,
            };
            match store.record_success(write).await {
                Ok(_) => {
                    stats.learnings.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::debug!("pattern learning write failed: {}", e),
            }
            break;
        }
    }
}

/// Periodic sweep task.
async fn sweep_loop(store: Store, config: CacheConfig) {
    let period = std::time::Duration::from_millis(config.cleanup_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the immediate first tick would sweep an empty cache
    interval.tick().await;
    loop {
        interval.tick().await;
        match store
            .sweep(
                config.selector_ttl_ms as i64,
                config.max_variations_per_selector as i64,
            )
            .await
        {
            Ok(outcome) => {
                if outcome.expired_mappings
                    + outcome.pruned_variations
                    + outcome.orphaned_selectors
                    + outcome.expired_snapshots
                    > 0
                {
                    log::debug!(
                        "sweep removed {} expired, {} over-cap, {} orphaned, {} snapshots",
                        outcome.expired_mappings,
                        outcome.pruned_variations,
                        outcome.orphaned_selectors,
                        outcome.expired_snapshots
                    );
                }
            }
            Err(e) => log::warn!("sweep failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{DomElement, DomSnapshot};
    use async_trait::async_trait;
    use tempfile::TempDir;

    async fn open_cache() -> (TempDir, BidirectionalCache) {
        let dir = TempDir::new().expect("tempdir");
        let config = CacheConfig::new().with_cache_dir(dir.path());
        let cache = BidirectionalCache::open(config).await.expect("open");
        (dir, cache)
    }

    #[tokio::test]
    async fn test_exact_hit() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("click login", "https://a/", "button#login")
            .await
            .expect("set");

        let hit = cache
            .get("click login", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "button#login");
        assert_eq!(hit.source, HitSource::Exact);
        assert!(hit.confidence >= 0.5);
        assert!(hit.cached);

        let stats = cache.stats();
        assert_eq!(stats.exact, 1);
        assert_eq!(stats.sets, 1);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_normalized_hit() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("Click the Login Button!", "https://a/", "#login")
            .await
            .expect("set");

        let hit = cache
            .get("click login button", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Normalized);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_reverse_hit_with_synonym() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("click login button", "https://a/", "#login")
            .await
            .expect("set");

        let hit = cache
            .get("press login button", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, "#login");
        assert!(matches!(
            hit.source,
            HitSource::Normalized | HitSource::Reverse
        ));
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_action_conflict_never_matches() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("login button user", "https://a/", "#login")
            .await
            .expect("set");

        let miss = cache.get("logout user", "https://a/").await.expect("get");
        assert!(miss.is_none(), "conflicting action must never match");
        assert_eq!(cache.stats().misses, 1);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_fuzzy_hit_on_typo() {
        let (_dir, cache) = open_cache().await;
        cache
            .set("submit form", "https://a/", ".submit")
            .await
            .expect("set");

        // transposition typo, distance 1, len 11 → bound ⌊11/8⌋ = 1
        let hit = cache
            .get("submiit form", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert_eq!(hit.selector, ".submit");
        assert_eq!(hit.source, HitSource::Fuzzy);

        let stored = cache
            .get("submit form", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert!(hit.confidence < stored.confidence);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_fuzzy_rejects_large_distance() {
        let (_dir, cache) = open_cache().await;
        cache.set("submit form", "https://a/", ".submit").await.expect("set");

        assert!(cache
            .get("sabmiit fxrm", "https://a/")
            .await
            .expect("get")
            .is_none());
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_invalidate_selector() {
        let (_dir, cache) = open_cache().await;
        cache.set("save", "https://a/", "btn.old").await.expect("set");

        let removed = cache
            .invalidate_selector("btn.old", "https://a/")
            .await
            .expect("invalidate");
        assert_eq!(removed, 1);

        assert!(cache.get("save", "https://a/").await.expect("get").is_none());
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_set_set_idempotent_counts() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#l").await.expect("set");
        cache.set("click login", "https://a/", "#l").await.expect("set");

        let counts = cache.store().counts().await.expect("counts");
        assert_eq!(counts.mappings, 1);
        let hit = cache
            .get("click login", "https://a/")
            .await
            .expect("get")
            .expect("hit");
        assert!(hit.confidence > 0.8);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_pattern_learning() {
        let (_dir, cache) = open_cache().await;
        // establish a sibling with success_count > 1
        cache.set("click login button", "https://a/", "#l").await.expect("set");
        cache.set("click login button", "https://a/", "#l").await.expect("set");
        // a new phrasing sharing two tokens
        cache.set("press login button", "https://a/", "#l").await.expect("set");

        // learning runs on a background worker
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if cache.stats().learnings > 0 {
                break;
            }
        }
        assert!(cache.stats().learnings >= 1, "expected a learned pattern");

        let counts = cache.store().counts().await.expect("counts");
        assert!(counts.mappings >= 3, "synthetic mapping stored");
        cache.close().await.expect("close");
    }

    struct StablePage;

    #[async_trait]
    impl SnapshotProvider for StablePage {
        async fn dom_snapshot(&self) -> Option<DomSnapshot> {
            Some(DomSnapshot {
                url: "https://a/".into(),
                elements: vec![
                    DomElement::new("form").with_id("login-form"),
                    DomElement::new("button").with_role("button").with_id("login"),
                    DomElement::new("h1").with_text("Welcome"),
                ],
            })
        }
    }

    #[tokio::test]
    async fn test_dom_augmented_get() {
        let (_dir, cache) = open_cache().await;
        let page = StablePage;
        cache
            .set_with_page("click login button", "https://a/", "#login", Some(&page))
            .await
            .expect("set");

        // unrelated wording defeats the ladder, the matching DOM carries it
        let hit = cache
            .get_with_page("choose account entry", "https://a/", Some(&page))
            .await
            .expect("get");
        let hit = hit.expect("dom-augmented hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Fuzzy);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_enhanced_cross_environment() {
        let (_dir, cache) = open_cache().await;
        let steps = vec![
            TestStep::new("goto"),
            TestStep::new("fill").with_selector("#user").with_value("alice"),
            TestStep::new("click").with_selector("button#login"),
        ];
        let page = StablePage;

        cache
            .set_enhanced(
                "login flow",
                "https://staging.x/path/42",
                &steps,
                "default",
                "#login",
                Some(&page),
            )
            .await
            .expect("set_enhanced");

        let hit = cache
            .get_enhanced(
                "login flow",
                "https://prod.x/path/99",
                &steps,
                "default",
                Some(&page),
            )
            .await
            .expect("get_enhanced")
            .expect("cross-environment hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Exact);
        assert!(hit.confidence > 0.0 && hit.confidence <= 1.0);
        assert_eq!(cache.stats().enhanced, 1);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_enhanced_falls_back_to_ladder() {
        let (_dir, cache) = open_cache().await;
        cache.set("login flow", "https://a/", "#login").await.expect("set");

        let hit = cache
            .get_enhanced("login flow", "https://a/", &[], "default", None)
            .await
            .expect("get_enhanced")
            .expect("legacy hit");
        assert_eq!(hit.selector, "#login");
        assert_eq!(hit.source, HitSource::Exact);
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_fallback() {
        let (_dir, cache) = open_cache().await;
        let page = StablePage;
        let payload = SnapshotPayload::new("text/html", &b"<html>login</html>"[..]);

        cache
            .set_snapshot(
                "page:login",
                &payload,
                SnapshotSetOptions {
                    url: Some("https://a/".into()),
                    profile: Some("default".into()),
                    ..Default::default()
                },
                Some(&page),
            )
            .await
            .expect("set_snapshot");

        let got = cache
            .get_snapshot("page:login", "default", SnapshotGetOptions::default(), None)
            .await
            .expect("get_snapshot")
            .expect("exact snapshot hit");
        assert_eq!(got, payload);

        // a different key with signature fallback serves the stored snapshot
        let via_fallback = cache
            .get_snapshot(
                "page:other",
                "default",
                SnapshotGetOptions {
                    url: Some("https://a/".into()),
                    dom_signature_fallback: true,
                },
                Some(&page),
            )
            .await
            .expect("get_snapshot")
            .expect("fallback snapshot hit");
        assert_eq!(via_fallback, payload);

        // without fallback the other key misses
        assert!(cache
            .get_snapshot("page:other", "default", SnapshotGetOptions::default(), None)
            .await
            .expect("get_snapshot")
            .is_none());
        cache.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_use() {
        let (_dir, cache) = open_cache().await;
        cache.close().await.expect("close");
        cache.close().await.expect("second close");
        assert!(matches!(
            cache.get("x", "https://a/").await,
            Err(CacheError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_clear_resets_storage() {
        let (_dir, cache) = open_cache().await;
        cache.set("click login", "https://a/", "#l").await.expect("set");
        cache.clear().await.expect("clear");
        let counts = cache.store().counts().await.expect("counts");
        assert_eq!(counts.mappings, 0);
        assert_eq!(counts.selectors, 0);
        cache.close().await.expect("close");
    }
}
