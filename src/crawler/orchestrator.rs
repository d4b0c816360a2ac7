//! Crawl orchestration
//!
//! Wires the proxy pool, fetcher, parser, worker pool, and store into the
//! two jobs the binary exposes: the ranged listing crawl and the
//! pending-queue detail crawl. The store is shared behind a mutex so writes
//! are serialized; everything else runs concurrently up to the configured
//! worker count.

use crate::config::Config;
use crate::crawler::fetcher::{Fetcher, RequestSpec};
use crate::crawler::parser::{
    parse_chapter_list, CoverParser, DetailParser, ListingParser, SitePageParser, Volume,
};
use crate::crawler::proxy::ProxyPool;
use crate::crawler::worker::{Outcome, WorkerPool};
use crate::storage::{RunStatus, SqliteStore, Store};
use crate::{CrawlError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregate counters for one crawl run
///
/// Totals are sums over per-item outcomes and hold regardless of the order
/// in which items completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlTotals {
    /// Work items processed (pages or pending rows)
    pub items: u64,
    /// Records seen across all parsed pages
    pub records: u64,
    /// Net-new rows written to the store
    pub inserted: u64,
    /// Items or records skipped as duplicates (or on shutdown)
    pub skipped: u64,
    /// Items that failed after retry exhaustion or a parse/persist error
    pub failed: u64,
}

impl CrawlTotals {
    fn absorb(&mut self, other: CrawlTotals) {
        self.items += other.items;
        self.records += other.records;
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Per-page result carried through a listing outcome
#[derive(Debug, Clone, Copy)]
struct PageResult {
    records: u64,
    inserted: u64,
    skipped: u64,
}

struct CrawlContext {
    fetcher: Arc<Fetcher>,
    parser: Arc<SitePageParser>,
    store: Arc<Mutex<SqliteStore>>,
    workers: WorkerPool,
}

fn build_context(config: &Config, shutdown: Arc<AtomicBool>) -> Result<CrawlContext> {
    let pool = Arc::new(ProxyPool::new(&config.proxies, &config.site.probe_url));
    let fetcher = Arc::new(Fetcher::new(
        pool,
        config.crawler.max_retries,
        Duration::from_secs(config.crawler.request_timeout_secs),
    )?);

    let store = SqliteStore::new(std::path::Path::new(&config.output.database_path))?;

    Ok(CrawlContext {
        fetcher,
        parser: Arc::new(SitePageParser::new()),
        store: Arc::new(Mutex::new(store)),
        workers: WorkerPool::new(
            config.crawler.workers as usize,
            config.crawler.backend,
            shutdown,
        ),
    })
}

/// Crawls listing pages `start..=end` and upserts the extracted records
///
/// Each page is one work item: fetch, parse, pre-filter against keys already
/// stored, upsert the remainder in one transaction. A page that fails its
/// retry budget or does not parse is counted failed and the run continues.
pub async fn run_listing_crawl(
    config: &Config,
    config_hash: &str,
    start: u32,
    end: u32,
    shutdown: Arc<AtomicBool>,
) -> Result<CrawlTotals> {
    let ctx = build_context(config, shutdown.clone())?;
    let run_id = ctx.store.lock().unwrap().create_run(config_hash, "listing")?;

    tracing::info!(start, end, workers = config.crawler.workers, "starting listing crawl");

    let referer = config.site.referer.clone();
    let template = config.site.listing_url_template.clone();
    let fetcher = ctx.fetcher.clone();
    let parser = ctx.parser.clone();
    let store = ctx.store.clone();

    let pages: Vec<u32> = (start..=end).collect();
    let outcomes = ctx
        .workers
        .run(pages, move |page| {
            let fetcher = fetcher.clone();
            let parser = parser.clone();
            let store = store.clone();
            let referer = referer.clone();
            let url = template.replace("{page}", &page.to_string());
            async move { crawl_listing_page(&fetcher, &*parser, &store, &url, &referer, page).await }
        })
        .await;

    let mut totals = CrawlTotals::default();
    for outcome in outcomes {
        totals.items += 1;
        match outcome {
            Outcome::Done(page) => {
                totals.records += page.records;
                totals.inserted += page.inserted;
                totals.skipped += page.skipped;
            }
            Outcome::Skipped(_) => totals.skipped += 1,
            Outcome::Failed(_) => totals.failed += 1,
        }
    }

    finish_run(&ctx.store, run_id, &shutdown)?;
    tracing::info!(
        pages = totals.items,
        records = totals.records,
        inserted = totals.inserted,
        skipped = totals.skipped,
        failed = totals.failed,
        "listing crawl finished"
    );

    Ok(totals)
}

async fn crawl_listing_page(
    fetcher: &Fetcher,
    parser: &dyn ListingParser,
    store: &Mutex<SqliteStore>,
    url: &str,
    referer: &str,
    page: u32,
) -> Outcome<PageResult> {
    let spec = RequestSpec::get(url).with_referer(referer);
    let document = match fetcher.fetch(&spec).await {
        Ok(document) => document,
        Err(e) => {
            tracing::error!(page, error = %e, "listing page fetch failed");
            return Outcome::Failed(e.to_string());
        }
    };

    let records = match parser.parse_listing(url, &document.body) {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(page, error = %e, "listing page parse failed");
            return Outcome::Failed(e.to_string());
        }
    };
    let seen = records.len() as u64;

    let mut store = store.lock().unwrap();
    let existing = match store.existing_keys() {
        Ok(keys) => keys,
        Err(e) => {
            tracing::error!(page, error = %e, "dedup key query failed");
            return Outcome::Failed(e.to_string());
        }
    };

    let fresh: Vec<_> = records
        .into_iter()
        .filter(|r| !existing.contains(&r.url) && !existing.contains(&r.name))
        .collect();

    match store.upsert_listings(&fresh) {
        Ok(inserted) => {
            let inserted = inserted as u64;
            tracing::info!(page, records = seen, inserted, skipped = seen - inserted, "page stored");
            Outcome::Done(PageResult {
                records: seen,
                inserted,
                skipped: seen - inserted,
            })
        }
        Err(e) => {
            // Zero-effect failure: nothing from this page was committed
            tracing::error!(page, error = %e, "listing upsert failed");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Drains the pending-detail queue in batches
///
/// Pulls up to `batch_size` rows with an unset detail flag, crawls each
/// book page, and persists the detail record together with the flag flip.
/// In continuous mode the loop sleeps the rest interval between batches and
/// keeps going until the queue is empty or shutdown is requested.
pub async fn run_detail_crawl(
    config: &Config,
    config_hash: &str,
    continuous: bool,
    batch_size_override: Option<u32>,
    shutdown: Arc<AtomicBool>,
) -> Result<CrawlTotals> {
    let ctx = build_context(config, shutdown.clone())?;
    let run_id = ctx.store.lock().unwrap().create_run(config_hash, "detail")?;
    let batch_size = batch_size_override.unwrap_or(config.crawler.batch_size);

    tracing::info!(batch_size, continuous, "starting detail crawl");

    let mut totals = CrawlTotals::default();

    loop {
        let batch = ctx.store.lock().unwrap().pending_detail(batch_size)?;
        if batch.is_empty() {
            tracing::info!("no pending detail work");
            break;
        }

        let fetcher = ctx.fetcher.clone();
        let parser = ctx.parser.clone();
        let store = ctx.store.clone();
        let referer = config.site.referer.clone();

        let outcomes = ctx
            .workers
            .run(batch, move |(listing_id, url)| {
                let fetcher = fetcher.clone();
                let parser = parser.clone();
                let store = store.clone();
                let referer = referer.clone();
                async move {
                    crawl_detail_page(&fetcher, &*parser, &store, listing_id, &url, &referer).await
                }
            })
            .await;

        let mut batch_totals = CrawlTotals::default();
        for outcome in &outcomes {
            batch_totals.items += 1;
            match outcome {
                Outcome::Done(()) => {
                    batch_totals.records += 1;
                    batch_totals.inserted += 1;
                }
                Outcome::Skipped(_) => batch_totals.skipped += 1,
                Outcome::Failed(_) => batch_totals.failed += 1,
            }
        }
        tracing::info!(
            items = batch_totals.items,
            inserted = batch_totals.inserted,
            skipped = batch_totals.skipped,
            failed = batch_totals.failed,
            "detail batch finished"
        );
        totals.absorb(batch_totals);

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !continuous {
            break;
        }
        // Failed items stay pending; without forward progress the next
        // batch would be the same rows again.
        if batch_totals.inserted + batch_totals.skipped == 0 {
            tracing::warn!("batch made no progress, stopping");
            break;
        }

        tracing::debug!(secs = config.crawler.rest_interval_secs, "resting between batches");
        tokio::time::sleep(Duration::from_secs(config.crawler.rest_interval_secs)).await;
    }

    finish_run(&ctx.store, run_id, &shutdown)?;
    tracing::info!(
        items = totals.items,
        inserted = totals.inserted,
        skipped = totals.skipped,
        failed = totals.failed,
        "detail crawl finished"
    );

    Ok(totals)
}

async fn crawl_detail_page(
    fetcher: &Fetcher,
    parser: &dyn DetailParser,
    store: &Mutex<SqliteStore>,
    listing_id: i64,
    url: &str,
    referer: &str,
) -> Outcome<()> {
    // A detail row may already exist from an earlier interrupted run; flag
    // the listing and move on without refetching.
    {
        let mut store = store.lock().unwrap();
        match store.has_detail(url) {
            Ok(true) => {
                if let Err(e) = store.mark_detail_crawled(listing_id) {
                    return Outcome::Failed(e.to_string());
                }
                tracing::debug!(url, "detail already stored, flagged");
                return Outcome::Skipped("detail already stored".to_string());
            }
            Ok(false) => {}
            Err(e) => return Outcome::Failed(e.to_string()),
        }
    }

    let spec = RequestSpec::get(url).with_referer(referer);
    let document = match fetcher.fetch(&spec).await {
        Ok(document) => document,
        Err(e) => {
            tracing::error!(url, error = %e, "detail fetch failed");
            return Outcome::Failed(e.to_string());
        }
    };

    let record = match parser.parse_detail(url, &document.body) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(url, error = %e, "detail parse failed");
            return Outcome::Failed(e.to_string());
        }
    };

    match store.lock().unwrap().save_detail(listing_id, url, &record) {
        Ok(()) => {
            tracing::info!(url, title = %record.title, "detail stored");
            Outcome::Done(())
        }
        Err(e) => {
            // The transaction rolled back; the pending flag is untouched
            tracing::error!(url, error = %e, "detail persist failed");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Backfills cover image URLs for listings that have none
///
/// Works the pending-cover queue the same way the detail crawl works its
/// queue: fetch the book page, extract the cover URL, update the row. A page
/// without a recognizable cover counts as failed and the row stays pending
/// for a later run.
pub async fn run_cover_crawl(
    config: &Config,
    config_hash: &str,
    continuous: bool,
    batch_size_override: Option<u32>,
    shutdown: Arc<AtomicBool>,
) -> Result<CrawlTotals> {
    let ctx = build_context(config, shutdown.clone())?;
    let run_id = ctx.store.lock().unwrap().create_run(config_hash, "covers")?;
    let batch_size = batch_size_override.unwrap_or(config.crawler.batch_size);

    tracing::info!(batch_size, continuous, "starting cover backfill");

    let mut totals = CrawlTotals::default();

    loop {
        let batch = ctx.store.lock().unwrap().pending_covers(batch_size)?;
        if batch.is_empty() {
            tracing::info!("no listings missing a cover");
            break;
        }

        let fetcher = ctx.fetcher.clone();
        let parser = ctx.parser.clone();
        let store = ctx.store.clone();
        let referer = config.site.referer.clone();

        let outcomes = ctx
            .workers
            .run(batch, move |(listing_id, url)| {
                let fetcher = fetcher.clone();
                let parser = parser.clone();
                let store = store.clone();
                let referer = referer.clone();
                async move {
                    crawl_cover_page(&fetcher, &*parser, &store, listing_id, &url, &referer).await
                }
            })
            .await;

        let mut batch_totals = CrawlTotals::default();
        for outcome in &outcomes {
            batch_totals.items += 1;
            match outcome {
                Outcome::Done(()) => {
                    batch_totals.records += 1;
                    batch_totals.inserted += 1;
                }
                Outcome::Skipped(_) => batch_totals.skipped += 1,
                Outcome::Failed(_) => batch_totals.failed += 1,
            }
        }
        tracing::info!(
            items = batch_totals.items,
            updated = batch_totals.inserted,
            skipped = batch_totals.skipped,
            failed = batch_totals.failed,
            "cover batch finished"
        );
        totals.absorb(batch_totals);

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !continuous {
            break;
        }
        // Coverless pages stay pending; without forward progress the next
        // batch would be the same rows again.
        if batch_totals.inserted + batch_totals.skipped == 0 {
            tracing::warn!("batch made no progress, stopping");
            break;
        }

        tracing::debug!(secs = config.crawler.rest_interval_secs, "resting between batches");
        tokio::time::sleep(Duration::from_secs(config.crawler.rest_interval_secs)).await;
    }

    finish_run(&ctx.store, run_id, &shutdown)?;
    tracing::info!(
        items = totals.items,
        updated = totals.inserted,
        failed = totals.failed,
        "cover backfill finished"
    );

    Ok(totals)
}

async fn crawl_cover_page(
    fetcher: &Fetcher,
    parser: &dyn CoverParser,
    store: &Mutex<SqliteStore>,
    listing_id: i64,
    url: &str,
    referer: &str,
) -> Outcome<()> {
    let spec = RequestSpec::get(url).with_referer(referer);
    let document = match fetcher.fetch(&spec).await {
        Ok(document) => document,
        Err(e) => {
            tracing::error!(url, error = %e, "cover fetch failed");
            return Outcome::Failed(e.to_string());
        }
    };

    let cover = match parser.parse_cover(url, &document.body) {
        Ok(Some(cover)) => cover,
        Ok(None) => {
            tracing::warn!(url, "no cover image found on page");
            return Outcome::Failed("no cover image found".to_string());
        }
        Err(e) => {
            tracing::error!(url, error = %e, "cover parse failed");
            return Outcome::Failed(e.to_string());
        }
    };

    match store.lock().unwrap().set_cover_url(listing_id, &cover) {
        Ok(()) => {
            tracing::info!(url, cover = %cover, "cover stored");
            Outcome::Done(())
        }
        Err(e) => {
            tracing::error!(url, error = %e, "cover persist failed");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Fetches and parses one book's chapter list via the form-POST endpoint
pub async fn fetch_chapter_list(config: &Config, book_id: u64) -> Result<Vec<Volume>> {
    let pool = Arc::new(ProxyPool::new(&config.proxies, &config.site.probe_url));
    let fetcher = Fetcher::new(
        pool,
        config.crawler.max_retries,
        Duration::from_secs(config.crawler.request_timeout_secs),
    )?;

    let referer = config
        .site
        .book_url_template
        .replace("{book_id}", &book_id.to_string());
    let spec = RequestSpec::post_form(
        &config.site.chapter_list_url,
        vec![
            ("book_id".to_string(), book_id.to_string()),
            ("chapter_id".to_string(), "0".to_string()),
            ("orderby".to_string(), "0".to_string()),
        ],
    )
    .with_referer(&referer);

    let document = fetcher.fetch(&spec).await?;
    parse_chapter_list(&document.body).map_err(|e| CrawlError::Parse {
        url: config.site.chapter_list_url.clone(),
        message: e.to_string(),
    })
}

fn finish_run(
    store: &Mutex<SqliteStore>,
    run_id: i64,
    shutdown: &AtomicBool,
) -> Result<()> {
    let status = if shutdown.load(Ordering::SeqCst) {
        RunStatus::Interrupted
    } else {
        RunStatus::Completed
    };
    store.lock().unwrap().complete_run(run_id, status)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_absorb() {
        let mut totals = CrawlTotals {
            items: 1,
            records: 20,
            inserted: 17,
            skipped: 3,
            failed: 0,
        };
        totals.absorb(CrawlTotals {
            items: 1,
            records: 10,
            inserted: 10,
            skipped: 0,
            failed: 1,
        });

        assert_eq!(totals.items, 2);
        assert_eq!(totals.records, 30);
        assert_eq!(totals.inserted, 27);
        assert_eq!(totals.skipped, 3);
        assert_eq!(totals.failed, 1);
    }

    // End-to-end crawl behavior is covered by the wiremock integration tests.
}
