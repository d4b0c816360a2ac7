//! Storage module for persisting crawl data
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Listing upsert with net-new accounting
//! - Detail persistence with atomic flag transition
//! - Pending-work queries for the detail crawl
//! - Run tracking

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{Store, StorageError, StorageResult};

/// One row of the paginated catalog
///
/// `url` is the unique key; re-crawling the same url updates the row in
/// place. The `detail_crawled` flag and `created_at` timestamp are managed
/// by the store and are not part of the parsed record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingRecord {
    pub category: String,
    pub name: String,
    pub url: String,
    pub latest_chapter: String,
    pub latest_chapter_url: String,
    pub author: String,
    pub author_url: String,
    pub word_count: String,
    pub update_time: String,
}

/// Extended per-book metadata from a book's own page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailRecord {
    pub title: String,
    pub author: String,
    pub author_id: String,
    pub description: String,
    pub last_update: String,
    pub status: String,
    pub tags: Vec<String>,
    pub stats: DetailStats,
}

/// Numeric statistics coerced from the free-text labels on a detail page
///
/// Every field defaults to 0 when the label is absent or the value does not
/// parse; coercion happens once, in the parser, not here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailStats {
    pub total_hits: i64,
    pub total_favor: i64,
    pub total_word: i64,
    pub total_recommend: i64,
    pub week_hits: i64,
    pub month_hits: i64,
    pub week_recommend: i64,
    pub month_recommend: i64,
    pub book_type: String,
    pub word_count: i64,
    pub chapter_count: i64,
    pub first_publish_status: Option<String>,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub mode: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in &[
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Interrupted,
            RunStatus::Failed,
        ] {
            let db_str = status.to_db_string();
            let parsed = RunStatus::from_db_string(db_str);
            assert_eq!(Some(*status), parsed);
        }
    }

    #[test]
    fn test_run_status_invalid() {
        assert_eq!(RunStatus::from_db_string("invalid"), None);
    }
}
