//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::storage::{DetailRecord, ListingRecord, RunRecord, RunStatus};
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Listing row not found: id {0}")]
    ListingNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Writes are row-level atomic; there are no cross-row transactions spanning
/// multiple work items, so one item's failure never rolls back another's
/// committed rows. Callers that share a store across concurrent tasks must
/// serialize writes (the orchestrator wraps the store in a mutex).
pub trait Store {
    // ===== Run Management =====

    /// Creates a new crawl run and returns its id
    ///
    /// `mode` records which job produced the run ("listing" or "detail").
    fn create_run(&mut self, config_hash: &str, mode: &str) -> StorageResult<i64>;

    /// Marks a run finished with the given terminal status
    fn complete_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// The most recently started run, if any
    fn last_run(&self) -> StorageResult<Option<RunRecord>>;

    // ===== Listing Management =====

    /// Inserts or replaces listing rows keyed by url, in one transaction
    ///
    /// Returns the number of net-new rows (post-count minus pre-count), not
    /// "rows affected" -- a conflicting upsert counts as affected but not new.
    /// On url conflict the existing row is updated in place, preserving its
    /// id and its detail_crawled flag.
    fn upsert_listings(&mut self, records: &[ListingRecord]) -> StorageResult<usize>;

    /// Returns every stored listing url and name
    ///
    /// Used as a cheap pre-filter before upserting a freshly parsed page;
    /// the unique constraint on url remains the actual enforcement.
    fn existing_keys(&self) -> StorageResult<HashSet<String>>;

    /// Rows still awaiting a detail crawl, ordered by id, capped at `limit`
    fn pending_detail(&self, limit: u32) -> StorageResult<Vec<(i64, String)>>;

    /// Rows with no stored cover image, ordered by id, capped at `limit`
    fn pending_covers(&self, limit: u32) -> StorageResult<Vec<(i64, String)>>;

    /// Records the cover image URL for a listing
    fn set_cover_url(&mut self, listing_id: i64, cover_url: &str) -> StorageResult<()>;

    // ===== Detail Management =====

    /// Whether a detail row already exists for this url
    fn has_detail(&self, url: &str) -> StorageResult<bool>;

    /// Persists a detail record and flips the owning listing's flag
    ///
    /// Both writes happen in one transaction: a detail row is never visible
    /// with detail_crawled still 0, nor the flag set without a detail row.
    fn save_detail(
        &mut self,
        listing_id: i64,
        url: &str,
        record: &DetailRecord,
    ) -> StorageResult<()>;

    /// Marks a listing's detail as crawled without writing a detail row
    ///
    /// Used when a pending listing turns out to already have a detail row
    /// from an earlier run.
    fn mark_detail_crawled(&mut self, listing_id: i64) -> StorageResult<()>;

    // ===== Statistics =====

    /// Total listing rows
    fn count_listings(&self) -> StorageResult<u64>;

    /// Total detail rows
    fn count_details(&self) -> StorageResult<u64>;

    /// Listing rows still awaiting a detail crawl
    fn count_pending(&self) -> StorageResult<u64>;

    /// Listing rows with no stored cover image
    fn count_missing_covers(&self) -> StorageResult<u64>;
}
