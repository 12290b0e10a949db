//! Configuration for the selector cache.

use crate::error::{CacheError, CacheResult};
use std::path::PathBuf;

/// Relative directory the database lives in when no explicit directory is
/// configured.
pub const DEFAULT_CACHE_DIR: &str = ".claude-playwright/cache";

/// Database file name inside the cache directory.
pub const DB_FILE_NAME: &str = "bidirectional-cache.db";

/// Structure to configure a [`TieredSelectorCache`](crate::TieredSelectorCache).
///
/// ```rust
/// use selector_cache::CacheConfig;
/// let mut config = CacheConfig::new();
/// config.memory_size = 250;
/// config.selector_ttl_ms = 10 * 60 * 1000;
/// assert!(config.validate().is_ok());
/// ```
///
/// The scoring constants at the bottom are tuned values carried over from
/// operational experience; override them only when measuring the effect.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Directory holding the database file. Defaults to
    /// `./.claude-playwright/cache` under the current working directory.
    pub cache_dir: Option<PathBuf>,
    /// Advisory ceiling for database size in megabytes. Exceeding it is
    /// reported by `health()`, never enforced inline.
    pub max_size_mb: u64,
    /// Idle TTL for input mappings in milliseconds. Mappings unused for
    /// longer are reclaimed by the periodic sweep.
    pub selector_ttl_ms: u64,
    /// Absolute TTL for page snapshots in milliseconds.
    pub snapshot_ttl_ms: u64,
    /// Cadence of the periodic sweep in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Per (selector, URL) upper bound on stored input mappings. Weaker
    /// mappings beyond the cap are pruned on the sweep.
    pub max_variations_per_selector: usize,
    /// Capacity of the in-memory LRU tier.
    pub memory_size: usize,
    /// Idle TTL for LRU entries in milliseconds, refreshed on access.
    pub memory_ttl_ms: u64,
    /// Warm the LRU from the most used stored mappings on start.
    pub preload_common_selectors: bool,

    /// Multiplicative confidence boost applied to a selector record on each
    /// successful use, capped at 1.0.
    pub selector_confidence_boost: f64,
    /// Multiplicative confidence boost applied to an input mapping on each
    /// successful use, capped at 1.0.
    pub mapping_confidence_boost: f64,
    /// Confidence penalty for hits resolved through reverse lookup.
    pub reverse_confidence_penalty: f64,
    /// Confidence discount for pre-cached input variations.
    pub variation_confidence_discount: f64,
    /// Weight of DOM-signature similarity in DOM-augmented lookups.
    pub dom_signature_weight: f64,
    /// Weight of input similarity in DOM-augmented lookups.
    pub input_similarity_weight: f64,
    /// Minimum DOM-signature similarity for snapshot fallback serving.
    pub dom_signature_threshold: f64,
    /// Minimum key-to-key similarity for enhanced near-match acceptance.
    pub enhanced_accept_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheConfig {
    /// Configuration with the stock defaults.
    pub fn new() -> Self {
        Self {
            cache_dir: None,
            max_size_mb: 50,
            selector_ttl_ms: 300_000,
            snapshot_ttl_ms: 1_800_000,
            cleanup_interval_ms: 60_000,
            max_variations_per_selector: 20,
            memory_size: 100,
            memory_ttl_ms: 300_000,
            preload_common_selectors: true,
            selector_confidence_boost: 1.02,
            mapping_confidence_boost: 1.05,
            reverse_confidence_penalty: 0.9,
            variation_confidence_discount: 0.95,
            dom_signature_weight: 0.7,
            input_similarity_weight: 0.3,
            dom_signature_threshold: 0.8,
            enhanced_accept_threshold: 0.60,
        }
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Resolved path of the database file.
    pub fn db_path(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.join(DB_FILE_NAME),
            None => PathBuf::from(DEFAULT_CACHE_DIR).join(DB_FILE_NAME),
        }
    }

    /// Reject nonsensical values before any resource is created.
    pub fn validate(&self) -> CacheResult<()> {
        fn positive(name: &str, v: u64) -> CacheResult<()> {
            if v == 0 {
                return Err(CacheError::Config(format!("{} must be non-zero", name)));
            }
            Ok(())
        }

        positive("max_size_mb", self.max_size_mb)?;
        positive("selector_ttl_ms", self.selector_ttl_ms)?;
        positive("snapshot_ttl_ms", self.snapshot_ttl_ms)?;
        positive("cleanup_interval_ms", self.cleanup_interval_ms)?;
        positive("memory_ttl_ms", self.memory_ttl_ms)?;
        positive(
            "max_variations_per_selector",
            self.max_variations_per_selector as u64,
        )?;
        positive("memory_size", self.memory_size as u64)?;

        for (name, v) in [
            ("selector_confidence_boost", self.selector_confidence_boost),
            ("mapping_confidence_boost", self.mapping_confidence_boost),
        ] {
            if !(v >= 1.0 && v.is_finite()) {
                return Err(CacheError::Config(format!("{} must be >= 1.0", name)));
            }
        }

        for (name, v) in [
            ("reverse_confidence_penalty", self.reverse_confidence_penalty),
            (
                "variation_confidence_discount",
                self.variation_confidence_discount,
            ),
            ("dom_signature_weight", self.dom_signature_weight),
            ("input_similarity_weight", self.input_similarity_weight),
            ("dom_signature_threshold", self.dom_signature_threshold),
            ("enhanced_accept_threshold", self.enhanced_accept_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) || !v.is_finite() {
                return Err(CacheError::Config(format!(
                    "{} must be within [0, 1]",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_size_mb, 50);
        assert_eq!(config.memory_size, 100);
        assert_eq!(config.max_variations_per_selector, 20);
        assert!((config.selector_confidence_boost - 1.02).abs() < f64::EPSILON);
        assert!((config.enhanced_accept_threshold - 0.60).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = CacheConfig::new();
        config.selector_ttl_ms = 0;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let mut config = CacheConfig::new();
        config.memory_size = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.cleanup_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_tunables_rejected() {
        let mut config = CacheConfig::new();
        config.mapping_confidence_boost = 0.5;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.dom_signature_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.reverse_confidence_penalty = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_db_path() {
        let config = CacheConfig::new().with_cache_dir("/tmp/cachetest");
        assert_eq!(
            config.db_path(),
            PathBuf::from("/tmp/cachetest/bidirectional-cache.db")
        );

        let config = CacheConfig::new();
        assert!(config
            .db_path()
            .to_string_lossy()
            .contains(".claude-playwright/cache"));
    }
}
