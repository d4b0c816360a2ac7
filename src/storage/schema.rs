//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Shuhai database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track crawl runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL
);

-- Catalog rows discovered from the paginated listing
CREATE TABLE IF NOT EXISTS listing (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT,
    name TEXT,
    url TEXT NOT NULL UNIQUE,
    latest_chapter TEXT,
    latest_chapter_url TEXT,
    author TEXT,
    author_url TEXT,
    word_count TEXT,
    update_time TEXT,
    cover_url TEXT,
    detail_crawled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_listing_pending ON listing(detail_crawled);
CREATE INDEX IF NOT EXISTS idx_listing_name ON listing(name);

-- Per-book metadata fetched from each book's own page
CREATE TABLE IF NOT EXISTS detail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES listing(id),
    url TEXT NOT NULL UNIQUE,
    title TEXT,
    author TEXT,
    author_id TEXT,
    description TEXT,
    last_update TEXT,
    status TEXT,
    tags TEXT,
    total_hits INTEGER NOT NULL DEFAULT 0,
    total_favor INTEGER NOT NULL DEFAULT 0,
    total_word INTEGER NOT NULL DEFAULT 0,
    total_recommend INTEGER NOT NULL DEFAULT 0,
    week_hits INTEGER NOT NULL DEFAULT 0,
    month_hits INTEGER NOT NULL DEFAULT 0,
    week_recommend INTEGER NOT NULL DEFAULT 0,
    month_recommend INTEGER NOT NULL DEFAULT 0,
    book_type TEXT,
    word_count INTEGER NOT NULL DEFAULT 0,
    chapter_count INTEGER NOT NULL DEFAULT 0,
    first_publish_status TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_detail_listing ON detail(listing_id);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
