//! # Selector Cache
//!
//! A bidirectional cache between natural-language element descriptions and
//! proven browser selectors, built for automation control layers.
//!
//! Given a description like `"click the submit button"` and a page URL, the
//! cache returns a previously successful CSS/XPath-style selector with a
//! confidence score. Given a selector, it accumulates every phrasing that has
//! resolved to it, so lookups keep working across typos, paraphrase and
//! environment changes.
//!
//! ## Features
//!
//! - **Tiered lookup**: in-memory LRU in front of a durable SQLite store
//! - **Four-level fallback ladder**: exact → normalized → reverse → fuzzy
//! - **Continuous learning**: every successful operation reinforces the
//!   stored mappings; related phrasings are learned in the background
//! - **Aggressive invalidation**: a selector that failed is never served again
//! - **Cross-environment reuse**: environment-independent keys built from
//!   URL patterns, DOM signatures and test structure
//! - **Self-healing**: a wrapped operation that fails falls back through
//!   generated selector candidates and caches the first one that works
//! - **Crash safety**: WAL journaling, full synchronous writes, corruption
//!   quarantine on open, schema migration with rollback
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use selector_cache::{CacheConfig, TieredSelectorCache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = TieredSelectorCache::open(CacheConfig::new()).await?;
//!
//!     cache.set("click login", "https://a/", "button#login").await?;
//!
//!     if let Some(hit) = cache.get("click login", "https://a/").await? {
//!         assert_eq!(hit.selector, "button#login");
//!     }
//!
//!     cache.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! The cache is an owned value: construct one per process (or per test),
//! share it behind an `Arc`, and close it explicitly. There is no global
//! state.

#![warn(missing_docs)]

pub mod bidirectional;
pub mod configuration;
pub mod error;
pub mod fallback;
pub mod keys;
pub mod migration;
pub mod normalize;
pub mod signature;
pub mod similarity;
pub mod snapshot;
pub mod store;
pub mod tiered;

// Re-exports
pub use bidirectional::{BidirectionalCache, CacheHit, HitSource, LadderStatsSnapshot};
pub use configuration::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use keys::{EnhancedKey, TestStep};
pub use migration::{MigrationManager, MigrationReport};
pub use normalize::{damerau_levenshtein, normalize, NormalizedInput};
pub use signature::{DomElement, DomSignature, DomSnapshot, SnapshotProvider};
pub use similarity::{similarity, Operation, SimilarityContext, CONFLICT};
pub use snapshot::{SnapshotGetOptions, SnapshotPayload, SnapshotSetOptions, Viewport};
pub use store::{LearnedFrom, MappingExport, Store};
pub use tiered::{
    CacheHealth, CacheStatsSnapshot, OperationError, TieredSelectorCache, WrappedOutcome,
};

/// FNV-1a 64-bit hash for cheap, deterministic content hashing.
///
/// Every hash that reaches the database (selector hashes, DOM stratum
/// hashes, key hashes) goes through this function: persisted hashes must be
/// byte-stable across processes, which rules out randomized hashers.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
