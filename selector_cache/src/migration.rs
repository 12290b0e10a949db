//! Schema migration from the legacy layout to enhanced keys.
//!
//! Version 1 databases hold only selector records and input mappings.
//! Migration derives an enhanced key for every legacy mapping and copies it
//! into `cache_keys_v2` in batches, tagged with its provenance, so
//! cross-environment lookups work on old data. The legacy read path stays
//! live either way; malformed rows are skipped and counted, never fatal.

use crate::error::CacheResult;
use crate::keys::EnhancedKey;
use crate::store::{Store, SCHEMA_VERSION};

/// Rows copied per transaction batch.
const MIGRATION_BATCH: i64 = 100;

/// Profile assigned to rows that predate profiles.
const LEGACY_PROFILE: &str = "default";

/// Where a database stands with respect to migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MigrationStatus {
    /// Recorded schema version.
    pub version: i64,
    /// Rows already carrying migration provenance.
    pub migrated_rows: u64,
    /// Whether a migration still needs to run.
    pub pending: bool,
}

/// Outcome of one migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MigrationReport {
    /// Legacy rows examined.
    pub examined: u64,
    /// Rows copied into the enhanced-key table.
    pub migrated: u64,
    /// Rows skipped (already present or unusable).
    pub skipped: u64,
}

/// Drives schema migration over a store.
#[derive(Debug)]
pub struct MigrationManager {
    store: Store,
}

impl MigrationManager {
    /// New manager over a store handle.
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Current migration status.
    pub async fn status(&self) -> CacheResult<MigrationStatus> {
        let version = self.store.schema_version().await?.unwrap_or(1);
        let migrated_rows = self.store.migrated_count().await?;
        Ok(MigrationStatus {
            version,
            migrated_rows,
            pending: version < SCHEMA_VERSION,
        })
    }

    /// Copy legacy rows into the enhanced-key table and record the new
    /// schema version. Running against an up-to-date database is a no-op.
    pub async fn migrate(&self) -> CacheResult<MigrationReport> {
        let mut report = MigrationReport::default();
        let status = self.status().await?;
        if !status.pending {
            return Ok(report);
        }

        let mut offset = 0i64;
        loop {
            let page = self.store.legacy_page(offset, MIGRATION_BATCH).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;

            for row in &page {
                report.examined += 1;
                let key = EnhancedKey::new(
                    &row.input,
                    &row.url,
                    &[],
                    row.selector_signature.clone(),
                    LEGACY_PROFILE,
                );
                let legacy_hash =
                    EnhancedKey::legacy_key_hash(&row.input, &row.url, LEGACY_PROFILE);
                match self
                    .store
                    .insert_migrated(&key, &legacy_hash, &row.selector, row.confidence)
                    .await
                {
                    Ok(true) => report.migrated += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        log::warn!("skipping unmigratable row {}: {}", row.id, e);
                        report.skipped += 1;
                    }
                }
            }
        }

        if !self.validate(&report).await? {
            log::warn!(
                "migration validation mismatch: {} migrated of {} examined",
                report.migrated,
                report.examined
            );
        }

        self.store.set_schema_version(SCHEMA_VERSION).await?;
        Ok(report)
    }

    /// Check the copied rows against the report.
    async fn validate(&self, report: &MigrationReport) -> CacheResult<bool> {
        let stored = self.store.migrated_count().await?;
        Ok(stored >= report.migrated)
    }

    /// Remove every migrated row and restore the legacy version mark.
    /// Returns the number of rows removed.
    pub async fn rollback(&self) -> CacheResult<u64> {
        let deleted = self.store.delete_migrated().await?;
        self.store.remove_schema_version(SCHEMA_VERSION).await?;
        self.store.set_schema_version(1).await?;
        Ok(deleted)
    }
}
