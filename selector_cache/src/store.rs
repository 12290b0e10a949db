//! Durable SQLite storage for selectors, mappings, snapshots and keys.
//!
//! One pool with a single connection per cache instance. Writes that touch
//! more than one statement run inside immediate transactions; the database
//! runs WAL journaling with full synchronous durability. A failed integrity
//! probe on open quarantines the file and recreates it empty rather than
//! refusing to start.

use crate::error::CacheResult;
use crate::keys::EnhancedKey;
use crate::normalize::NormalizedInput;
use crate::{fnv1a64, now_ms};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 2;

/// Provenance of an input mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnedFrom {
    /// Observed directly from a successful operation.
    #[default]
    Direct,
    /// Derived from a similar mapping.
    Inferred,
    /// Synthesized by background pattern learning.
    Pattern,
}

/// Content hash of a selector string, the identity of a selector record.
pub fn selector_hash(selector: &str) -> String {
    format!("{:016x}", fnv1a64(selector.as_bytes()))
}

/// An input mapping joined with its selector record.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    /// Mapping row id.
    pub id: i64,
    /// Selector hash both rows share.
    pub selector_hash: String,
    /// Raw input as originally phrased.
    pub input: String,
    /// Normalized input.
    pub normalized_input: String,
    /// Token list of the normalized input.
    pub tokens: Vec<String>,
    /// URL the mapping was proven on.
    pub url: String,
    /// Successful resolutions through this mapping.
    pub success_count: i64,
    /// Last successful use, unix ms.
    pub last_used: i64,
    /// Mapping confidence in `[0, 1]`.
    pub confidence: f64,
    /// How the mapping was learned.
    pub learned_from: LearnedFrom,
    /// The selector string.
    pub selector: String,
    /// Confidence of the selector record.
    pub selector_confidence: f64,
    /// DOM signature stored on the selector record, if any.
    pub selector_signature: Option<String>,
}

/// A stored enhanced-key row.
#[derive(Debug, Clone)]
pub struct EnhancedRow {
    /// Primary key hash.
    pub base_key_hash: String,
    /// The full key, when the stored serialization still parses.
    pub key: Option<EnhancedKey>,
    /// Pre-migration layout hash.
    pub legacy_key_hash: Option<String>,
    /// Stored selector.
    pub selector: String,
    /// Stored confidence.
    pub confidence: f64,
    /// Times this key resolved.
    pub use_count: i64,
    /// Provenance of the row ("v1" for migrated rows).
    pub migration_source: Option<String>,
}

/// A stored snapshot row.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    /// Caller-chosen cache key.
    pub cache_key: String,
    /// URL the snapshot belongs to.
    pub url: String,
    /// DOM content hash supplied by the caller.
    pub dom_hash: String,
    /// Opaque encoded payload.
    pub data: Vec<u8>,
    /// Viewport width.
    pub viewport_w: i64,
    /// Viewport height.
    pub viewport_h: i64,
    /// Browser profile.
    pub profile: String,
    /// Creation time, unix ms.
    pub created_at: i64,
    /// Absolute TTL in ms from creation.
    pub ttl: i64,
    /// Times this snapshot was served.
    pub hit_count: i64,
    /// Full DOM signature, when captured.
    pub dom_signature: Option<String>,
}

/// Aggregate row counts and size, for stats and health.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageCounts {
    /// Selector records.
    pub selectors: u64,
    /// Input mappings.
    pub mappings: u64,
    /// Enhanced keys.
    pub enhanced_keys: u64,
    /// Stored snapshots.
    pub snapshots: u64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    /// Mappings past their idle TTL.
    pub expired_mappings: u64,
    /// Mappings beyond the per-selector variation cap.
    pub pruned_variations: u64,
    /// Selector records left without any mapping.
    pub orphaned_selectors: u64,
    /// Snapshots past their absolute TTL.
    pub expired_snapshots: u64,
}

/// A mapping exported for diagnostics or seeding.
#[derive(Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MappingExport {
    /// Raw input phrase.
    pub input: String,
    /// Selector it resolves to.
    pub selector: String,
    /// URL scope.
    pub url: String,
    /// Mapping confidence.
    pub confidence: f64,
    /// Successful uses.
    pub success_count: i64,
    /// Provenance.
    pub learned_from: LearnedFrom,
}

/// Arguments for recording one successful resolution.
#[derive(Debug, Clone)]
pub struct SuccessWrite<'a> {
    /// Raw input phrase.
    pub input: &'a str,
    /// Its normalization.
    pub normalized: &'a NormalizedInput,
    /// Page URL.
    pub url: &'a str,
    /// The selector that worked.
    pub selector: &'a str,
    /// DOM signature of the page, if captured.
    pub dom_signature: Option<&'a str>,
    /// Provenance of the mapping.
    pub learned_from: LearnedFrom,
    /// Confidence for a fresh mapping row.
    pub initial_confidence: f64,
    /// Multiplicative boost for an existing selector record.
    pub selector_boost: f64,
    /// Multiplicative boost for an existing mapping row.
    pub mapping_boost: f64,
}

/// The SQLite store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path`, probing integrity first.
    ///
    /// A corrupted file is renamed `<name>.corrupted.<unix-ms>` and a fresh
    /// database is created in its place; the quarantine is logged, not
    /// returned as an error.
    pub async fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // a file sqlite refuses to open at all is as corrupted as one that
        // fails the probe
        let pool = match Self::connect(path).await {
            Ok(pool) if Self::integrity_ok(&pool).await => pool,
            Ok(pool) => {
                pool.close().await;
                let quarantined = Self::quarantine(path).await?;
                log::warn!(
                    "database failed integrity probe, quarantined as {}",
                    quarantined.display()
                );
                Self::connect(path).await?
            }
            Err(e) => {
                let quarantined = Self::quarantine(path).await?;
                log::warn!(
                    "database unreadable ({}), quarantined as {}",
                    e,
                    quarantined.display()
                );
                Self::connect(path).await?
            }
        };

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn connect(path: &Path) -> CacheResult<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    async fn integrity_ok(pool: &SqlitePool) -> bool {
        match sqlx::query_scalar::<_, String>("PRAGMA quick_check")
            .fetch_one(pool)
            .await
        {
            Ok(verdict) => verdict == "ok",
            Err(e) => {
                log::warn!("integrity probe failed: {}", e);
                false
            }
        }
    }

    async fn quarantine(path: &Path) -> CacheResult<PathBuf> {
        let quarantined =
            PathBuf::from(format!("{}.corrupted.{}", path.display(), now_ms()));
        tokio::fs::rename(path, &quarantined).await?;
        // companion WAL files belong to the quarantined database
        for suffix in ["-wal", "-shm"] {
            let companion = PathBuf::from(format!("{}{}", path.display(), suffix));
            let _ = tokio::fs::remove_file(&companion).await;
        }
        Ok(quarantined)
    }

    async fn init_schema(&self) -> CacheResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS selector_cache (
                selector_hash TEXT PRIMARY KEY,
                selector TEXT NOT NULL,
                url TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                use_count INTEGER NOT NULL DEFAULT 1,
                dom_signature TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_selector_url ON selector_cache (url);
            CREATE INDEX IF NOT EXISTS idx_selector_last_used ON selector_cache (last_used);
            CREATE INDEX IF NOT EXISTS idx_selector_signature ON selector_cache (dom_signature);

            CREATE TABLE IF NOT EXISTS input_mappings (
                id INTEGER PRIMARY KEY,
                selector_hash TEXT NOT NULL REFERENCES selector_cache(selector_hash) ON DELETE CASCADE,
                input TEXT NOT NULL,
                normalized_input TEXT NOT NULL,
                input_tokens TEXT NOT NULL,
                url TEXT NOT NULL,
                success_count INTEGER NOT NULL DEFAULT 1,
                last_used INTEGER NOT NULL,
                confidence REAL NOT NULL,
                learned_from TEXT NOT NULL DEFAULT 'direct',
                UNIQUE (selector_hash, normalized_input, url)
            );
            CREATE INDEX IF NOT EXISTS idx_mappings_norm_url ON input_mappings (normalized_input, url);
            CREATE INDEX IF NOT EXISTS idx_mappings_url ON input_mappings (url);
            CREATE INDEX IF NOT EXISTS idx_mappings_selector ON input_mappings (selector_hash);
            CREATE INDEX IF NOT EXISTS idx_mappings_last_used ON input_mappings (last_used);

            CREATE TABLE IF NOT EXISTS snapshot_cache (
                cache_key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                dom_hash TEXT NOT NULL DEFAULT '',
                snapshot_data BLOB NOT NULL,
                viewport_w INTEGER NOT NULL DEFAULT 0,
                viewport_h INTEGER NOT NULL DEFAULT 0,
                profile TEXT NOT NULL DEFAULT 'default',
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                ttl INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                dom_signature TEXT,
                critical_hash TEXT,
                important_hash TEXT,
                context_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_snapshot_url ON snapshot_cache (url);
            CREATE INDEX IF NOT EXISTS idx_snapshot_profile ON snapshot_cache (profile);

            CREATE TABLE IF NOT EXISTS cache_keys_v2 (
                base_key_hash TEXT PRIMARY KEY,
                enhanced_key TEXT NOT NULL,
                legacy_key_hash TEXT,
                test_name TEXT NOT NULL,
                url_pattern TEXT NOT NULL,
                dom_signature TEXT,
                steps_hash TEXT NOT NULL,
                profile TEXT NOT NULL,
                selector TEXT NOT NULL,
                confidence REAL NOT NULL,
                use_count INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                migration_source TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_keys_v2_pattern ON cache_keys_v2 (url_pattern);
            CREATE INDEX IF NOT EXISTS idx_keys_v2_profile ON cache_keys_v2 (profile);
            CREATE INDEX IF NOT EXISTS idx_keys_v2_legacy ON cache_keys_v2 (legacy_key_hash);

            CREATE TABLE IF NOT EXISTS schema_meta (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // A database that already holds mappings but no version row predates
        // the versioned schema: mark it v1 so migration can pick it up.
        if self.schema_version().await?.is_none() {
            let legacy_rows: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM input_mappings")
                    .fetch_one(&self.pool)
                    .await?;
            let version = if legacy_rows > 0 { 1 } else { SCHEMA_VERSION };
            self.set_schema_version(version).await?;
        }

        Ok(())
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schema version, if any was recorded.
    pub async fn schema_version(&self) -> CacheResult<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_meta")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Record a schema version.
    pub async fn set_schema_version(&self, version: i64) -> CacheResult<()> {
        sqlx::query("INSERT OR REPLACE INTO schema_meta (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a schema version row (rollback support).
    pub async fn remove_schema_version(&self, version: i64) -> CacheResult<()> {
        sqlx::query("DELETE FROM schema_meta WHERE version = ?")
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record one successful resolution: upsert the selector record, then
    /// the input mapping, in a single transaction. The selector upsert is
    /// visible to the mapping upsert; nothing partial is ever observable.
    pub async fn record_success(&self, write: SuccessWrite<'_>) -> CacheResult<String> {
        let hash = selector_hash(write.selector);
        let now = now_ms();
        let tokens_json = serde_json::to_string(&write.normalized.tokens)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO selector_cache
                (selector_hash, selector, url, confidence, created_at, last_used, use_count, dom_signature)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6)
            ON CONFLICT(selector_hash) DO UPDATE SET
                url = excluded.url,
                last_used = excluded.last_used,
                use_count = selector_cache.use_count + 1,
                confidence = MIN(1.0, selector_cache.confidence * ?7),
                dom_signature = COALESCE(excluded.dom_signature, selector_cache.dom_signature)
            "#,
        )
        .bind(&hash)
        .bind(write.selector)
        .bind(write.url)
        .bind(0.5_f64)
        .bind(now)
        .bind(write.dom_signature)
        .bind(write.selector_boost)
        .execute(&mut *tx)
        .await?;

        if write.learned_from == LearnedFrom::Direct {
            sqlx::query(
                r#"
                INSERT INTO input_mappings
                    (selector_hash, input, normalized_input, input_tokens, url,
                     success_count, last_used, confidence, learned_from)
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, 'direct')
                ON CONFLICT(selector_hash, normalized_input, url) DO UPDATE SET
                    success_count = input_mappings.success_count + 1,
                    last_used = excluded.last_used,
                    confidence = MIN(1.0, input_mappings.confidence * ?8),
                    learned_from = 'direct',
                    input = CASE
                        WHEN LENGTH(excluded.input) > LENGTH(input_mappings.input)
                        THEN excluded.input
                        ELSE input_mappings.input
                    END
                "#,
            )
            .bind(&hash)
            .bind(write.input)
            .bind(&write.normalized.normalized)
            .bind(&tokens_json)
            .bind(write.url)
            .bind(now)
            .bind(write.initial_confidence)
            .bind(write.mapping_boost)
            .execute(&mut *tx)
            .await?;
        } else {
            // learned rows never shadow a direct observation
            sqlx::query(
                r#"
                INSERT INTO input_mappings
                    (selector_hash, input, normalized_input, input_tokens, url,
                     success_count, last_used, confidence, learned_from)
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8)
                ON CONFLICT(selector_hash, normalized_input, url) DO UPDATE SET
                    confidence = MAX(input_mappings.confidence, excluded.confidence),
                    last_used = excluded.last_used
                WHERE input_mappings.learned_from != 'direct'
                "#,
            )
            .bind(&hash)
            .bind(write.input)
            .bind(&write.normalized.normalized)
            .bind(&tokens_json)
            .bind(write.url)
            .bind(now)
            .bind(write.initial_confidence)
            .bind(write.learned_from.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(hash)
    }

    /// Best mapping whose raw input and URL match exactly.
    pub async fn lookup_exact(&self, input: &str, url: &str) -> CacheResult<Option<CandidateRow>> {
        self.lookup_by_column("m.input", input, url).await
    }

    /// Best mapping whose normalized input and URL match.
    pub async fn lookup_normalized(
        &self,
        normalized: &str,
        url: &str,
    ) -> CacheResult<Option<CandidateRow>> {
        self.lookup_by_column("m.normalized_input", normalized, url).await
    }

    async fn lookup_by_column(
        &self,
        column: &str,
        value: &str,
        url: &str,
    ) -> CacheResult<Option<CandidateRow>> {
        let sql = format!(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            WHERE {} = ? AND m.url = ?
            ORDER BY m.confidence DESC, m.success_count DESC, m.last_used DESC
            LIMIT 1
            "#,
            column
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| candidate_from_row(&r)))
    }

    /// Candidate mappings on a URL with non-empty token lists, strongest
    /// first. Rows whose stored tokens fail to decode are skipped.
    pub async fn candidates_for_url(
        &self,
        url: &str,
        limit: i64,
    ) -> CacheResult<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            WHERE m.url = ? AND m.input_tokens != '[]'
            ORDER BY m.confidence DESC, m.success_count DESC, m.last_used DESC
            LIMIT ?
            "#,
        )
        .bind(url)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(candidate_from_row).collect())
    }

    /// Candidates on a URL used since `since_ms`, strongest first.
    pub async fn recent_candidates(
        &self,
        url: &str,
        since_ms: i64,
        limit: i64,
    ) -> CacheResult<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            WHERE m.url = ? AND m.last_used >= ?
            ORDER BY m.last_used DESC
            LIMIT ?
            "#,
        )
        .bind(url)
        .bind(since_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(candidate_from_row).collect())
    }

    /// Sibling mappings of a selector on a URL, excluding one normalized
    /// input, with more than one success. Feeds pattern learning.
    pub async fn sibling_mappings(
        &self,
        hash: &str,
        url: &str,
        exclude_normalized: &str,
        limit: i64,
    ) -> CacheResult<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            WHERE m.selector_hash = ? AND m.url = ? AND m.normalized_input != ?
              AND m.success_count > 1
            ORDER BY m.success_count DESC
            LIMIT ?
            "#,
        )
        .bind(hash)
        .bind(url)
        .bind(exclude_normalized)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(candidate_from_row).collect())
    }

    /// Delete every mapping of a selector on a URL; when no mapping of the
    /// selector remains anywhere, the selector record goes too. Returns the
    /// number of mappings removed.
    pub async fn invalidate_selector(&self, selector: &str, url: &str) -> CacheResult<u64> {
        let hash = selector_hash(selector);
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM input_mappings WHERE selector_hash = ? AND url = ?")
            .bind(&hash)
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM input_mappings WHERE selector_hash = ?")
                .bind(&hash)
                .fetch_one(&mut *tx)
                .await?;
        if remaining == 0 {
            sqlx::query("DELETE FROM selector_cache WHERE selector_hash = ?")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    /// One sweep pass: expire idle mappings, apply the variation cap,
    /// expire snapshots, collect orphaned selectors, then checkpoint the
    /// WAL.
    pub async fn sweep(
        &self,
        selector_ttl_ms: i64,
        variation_cap: i64,
    ) -> CacheResult<SweepOutcome> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let expired_mappings = sqlx::query("DELETE FROM input_mappings WHERE last_used + ? < ?")
            .bind(selector_ttl_ms)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let pruned_variations = sqlx::query(
            r#"
            DELETE FROM input_mappings WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY selector_hash, url
                        ORDER BY confidence DESC, success_count DESC, last_used DESC
                    ) AS rank
                    FROM input_mappings
                ) WHERE rank > ?
            )
            "#,
        )
        .bind(variation_cap)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let expired_snapshots =
            sqlx::query("DELETE FROM snapshot_cache WHERE created_at + ttl < ?")
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        let orphaned_selectors = sqlx::query(
            r#"
            DELETE FROM selector_cache WHERE selector_hash NOT IN (
                SELECT DISTINCT selector_hash FROM input_mappings
            )
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            log::warn!("wal checkpoint failed: {}", e);
        }

        Ok(SweepOutcome {
            expired_mappings,
            pruned_variations,
            orphaned_selectors,
            expired_snapshots,
        })
    }

    /// Store or refresh a snapshot row. An existing key keeps its hit
    /// count.
    pub async fn put_snapshot(&self, row: &SnapshotRow) -> CacheResult<()> {
        let (critical, important, context) = split_signature(row.dom_signature.as_deref());
        sqlx::query(
            r#"
            INSERT INTO snapshot_cache
                (cache_key, url, dom_hash, snapshot_data, viewport_w, viewport_h, profile,
                 created_at, last_used, ttl, hit_count, dom_signature,
                 critical_hash, important_hash, context_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, 0, ?10, ?11, ?12, ?13)
            ON CONFLICT(cache_key) DO UPDATE SET
                url = excluded.url,
                dom_hash = excluded.dom_hash,
                snapshot_data = excluded.snapshot_data,
                viewport_w = excluded.viewport_w,
                viewport_h = excluded.viewport_h,
                profile = excluded.profile,
                created_at = excluded.created_at,
                last_used = excluded.last_used,
                ttl = excluded.ttl,
                dom_signature = excluded.dom_signature,
                critical_hash = excluded.critical_hash,
                important_hash = excluded.important_hash,
                context_hash = excluded.context_hash
            "#,
        )
        .bind(&row.cache_key)
        .bind(&row.url)
        .bind(&row.dom_hash)
        .bind(&row.data)
        .bind(row.viewport_w)
        .bind(row.viewport_h)
        .bind(&row.profile)
        .bind(row.created_at)
        .bind(row.ttl)
        .bind(&row.dom_signature)
        .bind(critical)
        .bind(important)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch an unexpired snapshot by key and profile, bumping its usage.
    pub async fn get_snapshot(
        &self,
        cache_key: &str,
        profile: &str,
    ) -> CacheResult<Option<SnapshotRow>> {
        let now = now_ms();
        let row = sqlx::query(
            r#"
            SELECT cache_key, url, dom_hash, snapshot_data, viewport_w, viewport_h,
                   profile, created_at, ttl, hit_count, dom_signature
            FROM snapshot_cache
            WHERE cache_key = ? AND profile = ? AND created_at + ttl >= ?
            "#,
        )
        .bind(cache_key)
        .bind(profile)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let snapshot = row.map(|r| snapshot_from_row(&r));
        if let Some(s) = &snapshot {
            sqlx::query(
                "UPDATE snapshot_cache SET hit_count = hit_count + 1, last_used = ? WHERE cache_key = ?",
            )
            .bind(now)
            .bind(&s.cache_key)
            .execute(&self.pool)
            .await?;
        }
        Ok(snapshot)
    }

    /// Unexpired snapshots on a URL/profile that carry a DOM signature,
    /// most recent first. Feeds the signature-similarity fallback.
    pub async fn snapshot_candidates(
        &self,
        url: &str,
        profile: &str,
        limit: i64,
    ) -> CacheResult<Vec<SnapshotRow>> {
        let rows = sqlx::query(
            r#"
            SELECT cache_key, url, dom_hash, snapshot_data, viewport_w, viewport_h,
                   profile, created_at, ttl, hit_count, dom_signature
            FROM snapshot_cache
            WHERE url = ? AND profile = ? AND dom_signature IS NOT NULL
              AND created_at + ttl >= ?
            ORDER BY last_used DESC
            LIMIT ?
            "#,
        )
        .bind(url)
        .bind(profile)
        .bind(now_ms())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(snapshot_from_row).collect())
    }

    /// Upsert an enhanced-key row.
    pub async fn upsert_enhanced(
        &self,
        key: &EnhancedKey,
        selector: &str,
        confidence: f64,
        migration_source: Option<&str>,
    ) -> CacheResult<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO cache_keys_v2
                (base_key_hash, enhanced_key, legacy_key_hash, test_name, url_pattern,
                 dom_signature, steps_hash, profile, selector, confidence, use_count,
                 created_at, last_used, migration_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11, ?12)
            ON CONFLICT(base_key_hash) DO UPDATE SET
                selector = excluded.selector,
                confidence = MIN(1.0, MAX(cache_keys_v2.confidence, excluded.confidence)),
                use_count = cache_keys_v2.use_count + 1,
                last_used = excluded.last_used,
                dom_signature = COALESCE(excluded.dom_signature, cache_keys_v2.dom_signature)
            "#,
        )
        .bind(key.base_key_hash())
        .bind(key.serialize())
        .bind(Option::<String>::None)
        .bind(&key.test_name)
        .bind(&key.url_pattern)
        .bind(&key.dom_signature)
        .bind(format!("{:016x}", key.steps_hash))
        .bind(&key.profile)
        .bind(selector)
        .bind(confidence)
        .bind(now)
        .bind(migration_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a migrated legacy row, recording both hashes. Existing rows
    /// are left untouched.
    pub async fn insert_migrated(
        &self,
        key: &EnhancedKey,
        legacy_key_hash: &str,
        selector: &str,
        confidence: f64,
    ) -> CacheResult<bool> {
        let now = now_ms();
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO cache_keys_v2
                (base_key_hash, enhanced_key, legacy_key_hash, test_name, url_pattern,
                 dom_signature, steps_hash, profile, selector, confidence, use_count,
                 created_at, last_used, migration_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11, 'v1')
            "#,
        )
        .bind(key.base_key_hash())
        .bind(key.serialize())
        .bind(legacy_key_hash)
        .bind(&key.test_name)
        .bind(&key.url_pattern)
        .bind(&key.dom_signature)
        .bind(format!("{:016x}", key.steps_hash))
        .bind(&key.profile)
        .bind(selector)
        .bind(confidence)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    /// Exact enhanced lookup by base key hash, bumping usage on hit.
    pub async fn enhanced_by_hash(&self, hash: &str) -> CacheResult<Option<EnhancedRow>> {
        let row = sqlx::query(
            r#"
            SELECT base_key_hash, enhanced_key, legacy_key_hash, selector, confidence,
                   use_count, migration_source
            FROM cache_keys_v2 WHERE base_key_hash = ?
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        let hit = row.map(|r| enhanced_from_row(&r));
        if hit.is_some() {
            sqlx::query(
                "UPDATE cache_keys_v2 SET use_count = use_count + 1, last_used = ? WHERE base_key_hash = ?",
            )
            .bind(now_ms())
            .bind(hash)
            .execute(&self.pool)
            .await?;
        }
        Ok(hit)
    }

    /// Enhanced rows sharing a URL pattern or profile, most recent first.
    pub async fn enhanced_candidates(
        &self,
        url_pattern: &str,
        profile: &str,
        limit: i64,
    ) -> CacheResult<Vec<EnhancedRow>> {
        let rows = sqlx::query(
            r#"
            SELECT base_key_hash, enhanced_key, legacy_key_hash, selector, confidence,
                   use_count, migration_source
            FROM cache_keys_v2
            WHERE url_pattern = ? OR profile = ?
            ORDER BY last_used DESC
            LIMIT ?
            "#,
        )
        .bind(url_pattern)
        .bind(profile)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| enhanced_from_row(r)).collect())
    }

    /// Count of migrated rows.
    pub async fn migrated_count(&self) -> CacheResult<u64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_keys_v2 WHERE migration_source = 'v1'")
                .fetch_one(&self.pool)
                .await?;
        Ok(n as u64)
    }

    /// Delete all migrated rows (rollback support). Returns how many.
    pub async fn delete_migrated(&self) -> CacheResult<u64> {
        let deleted = sqlx::query("DELETE FROM cache_keys_v2 WHERE migration_source = 'v1'")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    /// One page of legacy mapping rows for migration, ordered by id.
    pub async fn legacy_page(&self, offset: i64, limit: i64) -> CacheResult<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            ORDER BY m.id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(candidate_from_row).collect())
    }

    /// Most used mappings overall, for LRU warm-up.
    pub async fn top_mappings(&self, limit: i64) -> CacheResult<Vec<CandidateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.selector_hash, m.input, m.normalized_input, m.input_tokens,
                   m.url, m.success_count, m.last_used, m.confidence, m.learned_from,
                   s.selector, s.confidence AS selector_confidence,
                   s.dom_signature AS selector_signature
            FROM input_mappings m
            JOIN selector_cache s ON s.selector_hash = m.selector_hash
            ORDER BY m.success_count DESC, m.last_used DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(candidate_from_row).collect())
    }

    /// Export every mapping on a URL.
    pub async fn export_mappings(&self, url: &str) -> CacheResult<Vec<MappingExport>> {
        let rows = self.candidates_for_url(url, i64::MAX).await?;
        Ok(rows
            .into_iter()
            .map(|c| MappingExport {
                input: c.input,
                selector: c.selector,
                url: c.url,
                confidence: c.confidence,
                success_count: c.success_count,
                learned_from: c.learned_from,
            })
            .collect())
    }

    /// Mappings whose selector record is missing. With foreign keys on this
    /// stays empty; `health()` reports any drift and the sweep clears it.
    pub async fn orphan_mapping_count(&self) -> CacheResult<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM input_mappings m
            WHERE NOT EXISTS (
                SELECT 1 FROM selector_cache s WHERE s.selector_hash = m.selector_hash
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u64)
    }

    /// Row counts and database size.
    pub async fn counts(&self) -> CacheResult<StorageCounts> {
        let selectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM selector_cache")
            .fetch_one(&self.pool)
            .await?;
        let mappings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM input_mappings")
            .fetch_one(&self.pool)
            .await?;
        let enhanced_keys: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_keys_v2")
            .fetch_one(&self.pool)
            .await?;
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshot_cache")
            .fetch_one(&self.pool)
            .await?;
        let db_size_bytes = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StorageCounts {
            selectors: selectors as u64,
            mappings: mappings as u64,
            enhanced_keys: enhanced_keys as u64,
            snapshots: snapshots as u64,
            db_size_bytes,
        })
    }

    /// Delete every row from every data table. Schema metadata stays.
    pub async fn clear(&self) -> CacheResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM input_mappings").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM selector_cache").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM snapshot_cache").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM cache_keys_v2").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Decode a joined mapping row, skipping rows whose stored token JSON is
/// malformed.
fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<CandidateRow> {
    let tokens_json: String = row.try_get("input_tokens").ok()?;
    let tokens: Vec<String> = match serde_json::from_str(&tokens_json) {
        Ok(t) => t,
        Err(e) => {
            log::warn!("skipping mapping row with malformed tokens: {}", e);
            return None;
        }
    };
    let learned_from = row
        .try_get::<String, _>("learned_from")
        .ok()
        .and_then(|s| LearnedFrom::from_str(&s).ok())
        .unwrap_or_default();

    Some(CandidateRow {
        id: row.try_get("id").ok()?,
        selector_hash: row.try_get("selector_hash").ok()?,
        input: row.try_get("input").ok()?,
        normalized_input: row.try_get("normalized_input").ok()?,
        tokens,
        url: row.try_get("url").ok()?,
        success_count: row.try_get("success_count").ok()?,
        last_used: row.try_get("last_used").ok()?,
        confidence: row.try_get("confidence").ok()?,
        learned_from,
        selector: row.try_get("selector").ok()?,
        selector_confidence: row.try_get("selector_confidence").ok()?,
        selector_signature: row.try_get("selector_signature").ok().flatten(),
    })
}

fn snapshot_from_row(row: &sqlx::sqlite::SqliteRow) -> SnapshotRow {
    SnapshotRow {
        cache_key: row.get("cache_key"),
        url: row.get("url"),
        dom_hash: row.get("dom_hash"),
        data: row.get("snapshot_data"),
        viewport_w: row.get("viewport_w"),
        viewport_h: row.get("viewport_h"),
        profile: row.get("profile"),
        created_at: row.get("created_at"),
        ttl: row.get("ttl"),
        hit_count: row.get("hit_count"),
        dom_signature: row.get("dom_signature"),
    }
}

fn enhanced_from_row(row: &sqlx::sqlite::SqliteRow) -> EnhancedRow {
    let serialized: String = row.get("enhanced_key");
    let key = EnhancedKey::deserialize(&serialized);
    if key.is_none() {
        log::warn!("stored enhanced key failed to parse, similarity skipped");
    }
    EnhancedRow {
        base_key_hash: row.get("base_key_hash"),
        key,
        legacy_key_hash: row.get("legacy_key_hash"),
        selector: row.get("selector"),
        confidence: row.get("confidence"),
        use_count: row.get("use_count"),
        migration_source: row.get("migration_source"),
    }
}

/// Split a rendered signature into its stored stratum columns.
fn split_signature(
    signature: Option<&str>,
) -> (Option<String>, Option<String>, Option<String>) {
    match signature.and_then(|s| {
        let mut parts = s.split('|');
        Some((
            parts.next()?.strip_prefix("C:")?.to_string(),
            parts.next()?.strip_prefix("I:")?.to_string(),
            parts.next()?.strip_prefix("K:")?.to_string(),
        ))
    }) {
        Some((c, i, k)) => (Some(c), Some(i), Some(k)),
        None => (None, None, None),
    }
}
