//! HTML parsers for the catalog, book, and chapter-list pages
//!
//! Extraction lives behind the `ListingParser` and `DetailParser` traits so
//! the crawl pipeline stays generic and tests can substitute fakes. The
//! shipped `SitePageParser` knows the markup of the target site:
//! - catalog pages carry one table row per book with six data cells;
//! - book pages expose most metadata through og: meta tags plus a handful of
//!   labeled statistic blocks;
//! - the chapter-list endpoint returns an HTML fragment of volume boxes.

use crate::storage::{DetailRecord, DetailStats, ListingRecord};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;

/// Errors produced while extracting records from a fetched document
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{url}: required element missing: {field}")]
    MissingField { url: String, field: String },

    #[error("Invalid CSS selector: {0}")]
    Selector(String),
}

/// Extracts catalog rows from one listing page
pub trait ListingParser: Send + Sync {
    fn parse_listing(&self, url: &str, html: &str) -> Result<Vec<ListingRecord>, ParseError>;
}

/// Extracts the metadata record from one book page
pub trait DetailParser: Send + Sync {
    fn parse_detail(&self, url: &str, html: &str) -> Result<DetailRecord, ParseError>;
}

/// Extracts the cover image URL from one book page
///
/// A page without a recognizable cover is `Ok(None)`, not an error; the
/// backfill job decides what to do with it.
pub trait CoverParser: Send + Sync {
    fn parse_cover(&self, url: &str, html: &str) -> Result<Option<String>, ParseError>;
}

/// One chapter entry from the chapter-list endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub url: String,
    pub locked: bool,
}

/// One volume grouping from the chapter-list endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Volume {
    pub title: String,
    pub chapters: Vec<Chapter>,
}

/// CSS-selector based parser for the target site's markup
pub struct SitePageParser;

impl SitePageParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SitePageParser {
    fn default() -> Self {
        Self::new()
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(format!("{}: {}", css, e)))
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Coerces a free-text statistic like "1.2万" or "3,456 字" to an integer
///
/// Keeps ASCII digits and the decimal point, parses the remainder as a float,
/// and truncates. Anything unparseable becomes 0.
pub fn coerce_numeric(raw: &str) -> i64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

impl ListingParser for SitePageParser {
    /// Parses the catalog table into records, one per row
    ///
    /// Rows missing a name or url (header rows, spacer rows) are skipped
    /// rather than failing the page.
    fn parse_listing(&self, url: &str, html: &str) -> Result<Vec<ListingRecord>, ParseError> {
        let document = Html::parse_document(html);
        let row_sel = selector("table tr")?;
        let cell_sel = selector("td")?;
        let link_sel = selector("a")?;

        let mut records = Vec::new();

        for row in document.select(&row_sel) {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.len() < 6 {
                continue;
            }

            let category = text_of(cells[0]);

            let (name, book_url) = match cells[1].select(&link_sel).next() {
                Some(link) => (
                    text_of(link),
                    link.value().attr("href").unwrap_or("").to_string(),
                ),
                None => continue,
            };
            if name.is_empty() || book_url.is_empty() {
                continue;
            }

            let (latest_chapter, latest_chapter_url) = match cells[2].select(&link_sel).next() {
                Some(link) => (
                    text_of(link),
                    link.value().attr("href").unwrap_or("").to_string(),
                ),
                None => (text_of(cells[2]), String::new()),
            };

            let (author, author_url) = match cells[3].select(&link_sel).next() {
                Some(link) => (
                    text_of(link),
                    link.value().attr("href").unwrap_or("").to_string(),
                ),
                None => (text_of(cells[3]), String::new()),
            };

            records.push(ListingRecord {
                category,
                name,
                url: book_url,
                latest_chapter,
                latest_chapter_url,
                author,
                author_url,
                word_count: text_of(cells[4]),
                update_time: text_of(cells[5]),
            });
        }

        if records.is_empty() {
            tracing::debug!(url, "listing page yielded no rows");
        }

        Ok(records)
    }
}

impl DetailParser for SitePageParser {
    fn parse_detail(&self, url: &str, html: &str) -> Result<DetailRecord, ParseError> {
        let document = Html::parse_document(html);

        let title = first_text(&document, "h1.title")?.ok_or_else(|| missing(url, "h1.title"))?;

        let author = meta_content(&document, "og:novel:author")?
            .ok_or_else(|| missing(url, "meta og:novel:author"))?;

        // The author link's last path segment is the site's author id
        let author_id = first_attr(&document, ".author-info a", "href")?
            .and_then(|href| href.rsplit('/').next().map(str::to_string))
            .unwrap_or_default();

        let description = meta_content(&document, "og:description")?.unwrap_or_default();

        // "最后更新：[2024-01-01 12:00:00]" -> "2024-01-01 12:00:00"
        let last_update = first_text(&document, "p.update-time")?
            .map(|raw| {
                raw.split('：')
                    .nth(1)
                    .unwrap_or("")
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();

        // "连载 · 签约" -> "连载"
        let status = first_text(&document, "p.update-state")?
            .map(|raw| raw.split('·').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();

        let tag_sel = selector("p.label-box span.label")?;
        let tags: Vec<String> = document
            .select(&tag_sel)
            .map(text_of)
            .filter(|t| !t.is_empty() && !t.contains("举报"))
            .collect();

        let stats = parse_stats(&document)?;

        Ok(DetailRecord {
            title,
            author,
            author_id,
            description,
            last_update,
            status,
            tags,
            stats,
        })
    }
}

impl CoverParser for SitePageParser {
    fn parse_cover(&self, url: &str, html: &str) -> Result<Option<String>, ParseError> {
        let document = Html::parse_document(html);

        if let Some(src) = first_attr(&document, "div.cover img", "src")? {
            if let Some(normalized) = normalize_image_url(&src, url) {
                return Ok(Some(normalized));
            }
        }

        // Fallback when the cover block is absent or malformed
        Ok(meta_content(&document, "og:image")?.and_then(|content| normalize_image_url(&content, url)))
    }
}

/// Resolves an image src to an absolute URL
///
/// Protocol-relative srcs get https; relative srcs are joined against the
/// page URL. Unresolvable srcs become `None`.
fn normalize_image_url(raw: &str, page_url: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{}", rest));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    url::Url::parse(page_url)
        .ok()?
        .join(raw)
        .ok()
        .map(|u| u.to_string())
}

fn missing(url: &str, field: &str) -> ParseError {
    ParseError::MissingField {
        url: url.to_string(),
        field: field.to_string(),
    }
}

fn first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .map(text_of)
        .filter(|s| !s.is_empty()))
}

fn first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|e| e.value().attr(attr))
        .map(str::to_string))
}

fn meta_content(document: &Html, property: &str) -> Result<Option<String>, ParseError> {
    let css = format!("meta[property=\"{}\"]", property);
    let sel = selector(&css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|e| e.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Reads the two labeled statistic blocks on a book page
///
/// `p.book-grade` alternates label and value text chunks; the property panel
/// carries label/value span pairs. Labels are mapped positionally onto the
/// record, unknown labels are ignored.
fn parse_stats(document: &Html) -> Result<DetailStats, ParseError> {
    let mut stats = DetailStats::default();

    let grade_sel = selector("p.book-grade")?;
    for block in document.select(&grade_sel) {
        let chunks: Vec<String> = block
            .text()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        for pair in chunks.chunks(2) {
            if pair.len() < 2 {
                continue;
            }
            let label = pair[0].trim_end_matches('：');
            let value = coerce_numeric(&pair[1]);
            match label {
                "总点击" => stats.total_hits = value,
                "总收藏" => stats.total_favor = value,
                "总字数" => stats.total_word = value,
                "总推荐" => stats.total_recommend = value,
                "周点击" => stats.week_hits = value,
                "月点击" => stats.month_hits = value,
                "周推荐" => stats.week_recommend = value,
                "月推荐" => stats.month_recommend = value,
                _ => {}
            }
        }
    }

    let property_sel = selector("div.book-property span")?;
    for item in document.select(&property_sel) {
        let chunks: Vec<String> = item
            .text()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if chunks.len() < 2 {
            continue;
        }
        let label = chunks[0].trim_end_matches('：');
        match label {
            "作品类型" => stats.book_type = chunks[1].clone(),
            "字数" => stats.word_count = coerce_numeric(&chunks[1]),
            "章节数" => stats.chapter_count = coerce_numeric(&chunks[1]),
            _ => {}
        }
    }

    let first_sel = selector("span.theme-color")?;
    for span in document.select(&first_sel) {
        let text = text_of(span);
        if text.contains("本站首发") {
            stats.first_publish_status = Some("本站首发".to_string());
            break;
        }
    }

    Ok(stats)
}

/// Parses the chapter-list fragment returned by the form-POST endpoint
///
/// Each volume box holds a sub-title heading and a list of chapter links; a
/// lock icon inside the link marks a paywalled chapter.
pub fn parse_chapter_list(html: &str) -> Result<Vec<Volume>, ParseError> {
    let document = Html::parse_document(html);
    let volume_sel = selector("div.book-chapter-box")?;
    let title_sel = selector("h4.sub-tit")?;
    let chapter_sel = selector("ul.book-chapter-list li a")?;
    let lock_sel = selector("i.icon-lock")?;

    let mut volumes = Vec::new();

    for volume in document.select(&volume_sel) {
        let title = volume
            .select(&title_sel)
            .next()
            .map(text_of)
            .unwrap_or_default();

        let chapters = volume
            .select(&chapter_sel)
            .map(|link| Chapter {
                title: text_of(link),
                url: link.value().attr("href").unwrap_or("").to_string(),
                locked: link.select(&lock_sel).next().is_some(),
            })
            .collect();

        volumes.push(Volume { title, chapters });
    }

    Ok(volumes)
}
