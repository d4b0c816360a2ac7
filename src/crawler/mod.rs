//! Crawl pipeline
//!
//! This module contains the concurrent fetch pipeline:
//! - Proxy pool with lazy liveness validation and permanent eviction
//! - Retrying HTTP fetcher with randomized backoff and rotation
//! - Bounded-concurrency worker pool with two dispatch backends
//! - Page parsers for the catalog, book, and chapter-list markup
//! - Orchestration of the listing and detail jobs

mod fetcher;
mod orchestrator;
mod parser;
mod proxy;
mod worker;

pub use fetcher::{FetchError, Fetcher, RawDocument, RequestMethod, RequestSpec};
pub use orchestrator::{
    fetch_chapter_list, run_cover_crawl, run_detail_crawl, run_listing_crawl, CrawlTotals,
};
pub use parser::{
    coerce_numeric, parse_chapter_list, Chapter, CoverParser, DetailParser, ListingParser,
    ParseError, SitePageParser, Volume,
};
pub use proxy::ProxyPool;
pub use worker::{Outcome, WorkerPool};
