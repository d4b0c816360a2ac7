//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Store trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Store, StorageError, StorageResult};
use crate::storage::{DetailRecord, ListingRecord, RunRecord, RunStatus};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates a database at the given path
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn count(&self, sql: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl Store for SqliteStore {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str, mode: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, mode, status) VALUES (?1, ?2, ?3, ?4)",
            params![now, config_hash, mode, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn complete_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        Ok(())
    }

    fn last_run(&self) -> StorageResult<Option<RunRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, started_at, finished_at, config_hash, mode, status
             FROM runs ORDER BY id DESC LIMIT 1",
        )?;

        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let status: String = row.get(5)?;
                Ok(Some(RunRecord {
                    id: row.get(0)?,
                    started_at: row.get(1)?,
                    finished_at: row.get(2)?,
                    config_hash: row.get(3)?,
                    mode: row.get(4)?,
                    status: RunStatus::from_db_string(&status).unwrap_or(RunStatus::Failed),
                }))
            }
            None => Ok(None),
        }
    }

    // ===== Listing Management =====

    fn upsert_listings(&mut self, records: &[ListingRecord]) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;

        let before: i64 = tx.query_row("SELECT COUNT(*) FROM listing", [], |row| row.get(0))?;

        {
            // On conflict the row is updated in place so its id (and any
            // detail row pointing at it) survives a re-crawl.
            let mut stmt = tx.prepare_cached(
                "INSERT INTO listing (
                     category, name, url, latest_chapter, latest_chapter_url,
                     author, author_url, word_count, update_time, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(url) DO UPDATE SET
                     category = excluded.category,
                     name = excluded.name,
                     latest_chapter = excluded.latest_chapter,
                     latest_chapter_url = excluded.latest_chapter_url,
                     author = excluded.author,
                     author_url = excluded.author_url,
                     word_count = excluded.word_count,
                     update_time = excluded.update_time",
            )?;

            let now = Utc::now().to_rfc3339();
            for record in records {
                stmt.execute(params![
                    record.category,
                    record.name,
                    record.url,
                    record.latest_chapter,
                    record.latest_chapter_url,
                    record.author,
                    record.author_url,
                    record.word_count,
                    record.update_time,
                    now,
                ])?;
            }
        }

        let after: i64 = tx.query_row("SELECT COUNT(*) FROM listing", [], |row| row.get(0))?;
        tx.commit()?;

        Ok((after - before) as usize)
    }

    fn existing_keys(&self) -> StorageResult<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT url FROM listing UNION SELECT name FROM listing")?;

        let mut keys = HashSet::new();
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
        for row in rows {
            if let Some(key) = row? {
                keys.insert(key);
            }
        }

        Ok(keys)
    }

    fn pending_detail(&self, limit: u32) -> StorageResult<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, url FROM listing WHERE detail_crawled = 0 ORDER BY id LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn pending_covers(&self, limit: u32) -> StorageResult<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, url FROM listing
             WHERE cover_url IS NULL OR cover_url = ''
             ORDER BY id LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn set_cover_url(&mut self, listing_id: i64, cover_url: &str) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE listing SET cover_url = ?2 WHERE id = ?1",
            params![listing_id, cover_url],
        )?;
        if updated == 0 {
            return Err(StorageError::ListingNotFound(listing_id));
        }
        Ok(())
    }

    // ===== Detail Management =====

    fn has_detail(&self, url: &str) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detail WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn save_detail(
        &mut self,
        listing_id: i64,
        url: &str,
        record: &DetailRecord,
    ) -> StorageResult<()> {
        let tx = self.conn.transaction()?;

        let now = Utc::now().to_rfc3339();
        let tags = record.tags.join(",");
        tx.execute(
            "INSERT INTO detail (
                 listing_id, url, title, author, author_id, description,
                 last_update, status, tags,
                 total_hits, total_favor, total_word, total_recommend,
                 week_hits, month_hits, week_recommend, month_recommend,
                 book_type, word_count, chapter_count, first_publish_status,
                 created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                       ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(url) DO UPDATE SET
                 listing_id = excluded.listing_id,
                 title = excluded.title,
                 author = excluded.author,
                 author_id = excluded.author_id,
                 description = excluded.description,
                 last_update = excluded.last_update,
                 status = excluded.status,
                 tags = excluded.tags,
                 total_hits = excluded.total_hits,
                 total_favor = excluded.total_favor,
                 total_word = excluded.total_word,
                 total_recommend = excluded.total_recommend,
                 week_hits = excluded.week_hits,
                 month_hits = excluded.month_hits,
                 week_recommend = excluded.week_recommend,
                 month_recommend = excluded.month_recommend,
                 book_type = excluded.book_type,
                 word_count = excluded.word_count,
                 chapter_count = excluded.chapter_count,
                 first_publish_status = excluded.first_publish_status",
            params![
                listing_id,
                url,
                record.title,
                record.author,
                record.author_id,
                record.description,
                record.last_update,
                record.status,
                tags,
                record.stats.total_hits,
                record.stats.total_favor,
                record.stats.total_word,
                record.stats.total_recommend,
                record.stats.week_hits,
                record.stats.month_hits,
                record.stats.week_recommend,
                record.stats.month_recommend,
                record.stats.book_type,
                record.stats.word_count,
                record.stats.chapter_count,
                record.stats.first_publish_status,
                now,
            ],
        )?;

        let updated = tx.execute(
            "UPDATE listing SET detail_crawled = 1 WHERE id = ?1",
            params![listing_id],
        )?;
        if updated == 0 {
            // Dropping the transaction rolls the detail insert back
            return Err(StorageError::ListingNotFound(listing_id));
        }

        tx.commit()?;
        Ok(())
    }

    fn mark_detail_crawled(&mut self, listing_id: i64) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE listing SET detail_crawled = 1 WHERE id = ?1",
            params![listing_id],
        )?;
        if updated == 0 {
            return Err(StorageError::ListingNotFound(listing_id));
        }
        Ok(())
    }

    // ===== Statistics =====

    fn count_listings(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM listing")
    }

    fn count_details(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM detail")
    }

    fn count_pending(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM listing WHERE detail_crawled = 0")
    }

    fn count_missing_covers(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM listing WHERE cover_url IS NULL OR cover_url = ''")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DetailStats;

    fn listing(name: &str, url: &str) -> ListingRecord {
        ListingRecord {
            category: "fantasy".to_string(),
            name: name.to_string(),
            url: url.to_string(),
            latest_chapter: "Chapter 12".to_string(),
            latest_chapter_url: format!("{}/chapter/12", url),
            author: "someone".to_string(),
            author_url: "https://books.example.com/author/1".to_string(),
            word_count: "120k".to_string(),
            update_time: "2024-01-01".to_string(),
        }
    }

    fn detail(title: &str) -> DetailRecord {
        DetailRecord {
            title: title.to_string(),
            author: "someone".to_string(),
            author_id: "1".to_string(),
            description: "a book".to_string(),
            last_update: "2024-01-01".to_string(),
            status: "ongoing".to_string(),
            tags: vec!["tag1".to_string(), "tag2".to_string()],
            stats: DetailStats {
                total_hits: 1000,
                chapter_count: 12,
                ..DetailStats::default()
            },
        }
    }

    #[test]
    fn test_upsert_reports_net_new_rows() {
        let mut store = SqliteStore::new_in_memory().unwrap();

        let records = vec![
            listing("Book A", "https://books.example.com/book/1"),
            listing("Book B", "https://books.example.com/book/2"),
        ];
        assert_eq!(store.upsert_listings(&records).unwrap(), 2);
        assert_eq!(store.count_listings().unwrap(), 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = SqliteStore::new_in_memory().unwrap();

        let records = vec![listing("Book A", "https://books.example.com/book/1")];
        assert_eq!(store.upsert_listings(&records).unwrap(), 1);

        // Second upsert of the identical url: one row remains, zero net-new
        assert_eq!(store.upsert_listings(&records).unwrap(), 0);
        assert_eq!(store.count_listings().unwrap(), 1);
    }

    #[test]
    fn test_upsert_conflict_preserves_id_and_flag() {
        let mut store = SqliteStore::new_in_memory().unwrap();

        let url = "https://books.example.com/book/1";
        store.upsert_listings(&[listing("Book A", url)]).unwrap();

        let (id, _) = store.pending_detail(10).unwrap()[0].clone();
        store.save_detail(id, url, &detail("Book A")).unwrap();

        // Re-crawl of the same url with updated fields
        let mut updated = listing("Book A", url);
        updated.latest_chapter = "Chapter 13".to_string();
        assert_eq!(store.upsert_listings(&[updated]).unwrap(), 0);

        // Id unchanged, detail_crawled still set, latest_chapter refreshed
        let (found_id, chapter, crawled): (i64, String, i64) = store
            .conn
            .query_row(
                "SELECT id, latest_chapter, detail_crawled FROM listing WHERE url = ?1",
                params![url],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(found_id, id);
        assert_eq!(chapter, "Chapter 13");
        assert_eq!(crawled, 1);
    }

    #[test]
    fn test_existing_keys_contains_urls_and_names() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        store
            .upsert_listings(&[listing("Book A", "https://books.example.com/book/1")])
            .unwrap();

        let keys = store.existing_keys().unwrap();
        assert!(keys.contains("Book A"));
        assert!(keys.contains("https://books.example.com/book/1"));
        assert!(!keys.contains("Book B"));
    }

    #[test]
    fn test_pending_detail_respects_limit_and_order() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let records: Vec<ListingRecord> = (1..=5)
            .map(|i| {
                listing(
                    &format!("Book {}", i),
                    &format!("https://books.example.com/book/{}", i),
                )
            })
            .collect();
        store.upsert_listings(&records).unwrap();

        let pending = store.pending_detail(3).unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_save_detail_flips_flag_atomically() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let url = "https://books.example.com/book/1";
        store.upsert_listings(&[listing("Book A", url)]).unwrap();

        let (id, _) = store.pending_detail(1).unwrap()[0].clone();
        store.save_detail(id, url, &detail("Book A")).unwrap();

        assert!(store.has_detail(url).unwrap());
        assert_eq!(store.count_pending().unwrap(), 0);
        assert_eq!(store.count_details().unwrap(), 1);
    }

    #[test]
    fn test_save_detail_missing_listing_rolls_back() {
        let mut store = SqliteStore::new_in_memory().unwrap();

        let result = store.save_detail(999, "https://books.example.com/book/999", &detail("X"));
        assert!(matches!(result, Err(StorageError::ListingNotFound(999))));

        // Neither half of the write survives
        assert!(!store.has_detail("https://books.example.com/book/999").unwrap());
        assert_eq!(store.count_details().unwrap(), 0);
    }

    #[test]
    fn test_save_detail_twice_keeps_single_row() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let url = "https://books.example.com/book/1";
        store.upsert_listings(&[listing("Book A", url)]).unwrap();

        let (id, _) = store.pending_detail(1).unwrap()[0].clone();
        store.save_detail(id, url, &detail("Book A")).unwrap();
        store.save_detail(id, url, &detail("Book A (revised)")).unwrap();

        assert_eq!(store.count_details().unwrap(), 1);
        let title: String = store
            .conn
            .query_row(
                "SELECT title FROM detail WHERE url = ?1",
                params![url],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, "Book A (revised)");
    }

    #[test]
    fn test_mark_detail_crawled() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let url = "https://books.example.com/book/1";
        store.upsert_listings(&[listing("Book A", url)]).unwrap();

        let (id, _) = store.pending_detail(1).unwrap()[0].clone();
        store.mark_detail_crawled(id).unwrap();

        assert_eq!(store.count_pending().unwrap(), 0);
        // No detail row was written
        assert!(!store.has_detail(url).unwrap());
    }

    #[test]
    fn test_pending_covers_and_set_cover_url() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let records: Vec<ListingRecord> = (1..=3)
            .map(|i| {
                listing(
                    &format!("Book {}", i),
                    &format!("https://books.example.com/book/{}", i),
                )
            })
            .collect();
        store.upsert_listings(&records).unwrap();

        assert_eq!(store.count_missing_covers().unwrap(), 3);
        let pending = store.pending_covers(10).unwrap();
        assert_eq!(pending.len(), 3);

        let (id, _) = pending[0].clone();
        store
            .set_cover_url(id, "https://img.example.com/cover/1.jpg")
            .unwrap();

        assert_eq!(store.count_missing_covers().unwrap(), 2);
        assert!(store.pending_covers(10).unwrap().iter().all(|(i, _)| *i != id));
    }

    #[test]
    fn test_set_cover_url_missing_listing() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let result = store.set_cover_url(999, "https://img.example.com/x.jpg");
        assert!(matches!(result, Err(StorageError::ListingNotFound(999))));
    }

    #[test]
    fn test_upsert_conflict_preserves_cover_url() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let url = "https://books.example.com/book/1";
        store.upsert_listings(&[listing("Book A", url)]).unwrap();

        let (id, _) = store.pending_covers(1).unwrap()[0].clone();
        store
            .set_cover_url(id, "https://img.example.com/cover/1.jpg")
            .unwrap();

        // Re-crawl of the same url must not blank the stored cover
        store.upsert_listings(&[listing("Book A", url)]).unwrap();
        assert_eq!(store.count_missing_covers().unwrap(), 0);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let run_id = store.create_run("abc123", "listing").unwrap();
        assert!(run_id > 0);

        store.complete_run(run_id, RunStatus::Completed).unwrap();

        let (status, finished): (String, Option<String>) = store
            .conn
            .query_row(
                "SELECT status, finished_at FROM runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "completed");
        assert!(finished.is_some());
    }

    #[test]
    fn test_last_run_returns_most_recent() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        assert!(store.last_run().unwrap().is_none());

        let first = store.create_run("abc123", "listing").unwrap();
        store.complete_run(first, RunStatus::Completed).unwrap();
        store.create_run("abc123", "detail").unwrap();

        let last = store.last_run().unwrap().unwrap();
        assert_eq!(last.mode, "detail");
        assert_eq!(last.status, RunStatus::Running);
        assert!(last.finished_at.is_none());
    }
}
