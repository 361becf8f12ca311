//! Collector contracts plus the fixture-backed and HTML listing collectors.
//!
//! A collector turns one source into a flat list of [`RawCandidate`]s. It never
//! fingerprints, deduplicates or persists; that is the sync pipeline's job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use evcat_core::{RawCandidate, SharedClock};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

mod dates;
mod fetch;

pub use dates::{parse_event_date, parse_listing_date, parse_relative_date};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpFetcher,
    HttpFetcherConfig, RetryDisposition,
};

pub const CRATE_NAME: &str = "evcat-collectors";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fixture {}: {message}", path.display())]
    Fixture { path: PathBuf, message: String },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> &str;

    /// Scrape every candidate the source currently lists. An `Err` fails this
    /// source only; the run carries on with the others.
    async fn scrape(&self) -> Result<Vec<RawCandidate>, CollectorError>;
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    pub collector: CollectorKind,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectorKind {
    /// Replays a captured listing from disk. Path is relative to the workspace
    /// root.
    Fixture { path: PathBuf },
    /// Fetches live listing pages and extracts cards with CSS selectors.
    Html {
        listing_urls: Vec<String>,
        selectors: ListingSelectors,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    /// Matches one element per event card; the others are scoped to it.
    pub item: String,
    pub title: String,
    pub date: String,
    /// Read the date from this attribute (e.g. `datetime`) instead of the text.
    #[serde(default)]
    pub date_attr: Option<String>,
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Shared handles a collector may need.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    pub http: Arc<HttpFetcher>,
    pub clock: SharedClock,
    pub workspace_root: PathBuf,
}

pub fn collector_for_source(
    source: &SourceConfig,
    ctx: &CollectorContext,
) -> Result<Box<dyn Collector>, CollectorError> {
    let base_url = Url::parse(&source.base_url).map_err(|e| {
        CollectorError::Message(format!(
            "source {} has an invalid base_url {}: {e}",
            source.source_id, source.base_url
        ))
    })?;

    match &source.collector {
        CollectorKind::Fixture { path } => Ok(Box::new(FixtureCollector {
            source_id: source.source_id.clone(),
            path: ctx.workspace_root.join(path),
            base_url,
            clock: ctx.clock.clone(),
        })),
        CollectorKind::Html {
            listing_urls,
            selectors,
        } => Ok(Box::new(HtmlListingCollector {
            source_id: source.source_id.clone(),
            base_url,
            listing_urls: listing_urls.clone(),
            selectors: selectors.clone(),
            http: ctx.http.clone(),
            clock: ctx.clock.clone(),
        })),
    }
}

/// Resolve `href` against `base`. Unresolvable links become empty strings.
pub fn absolute_url(base: &Url, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    match base.join(href) {
        Ok(url) => url.to_string(),
        Err(err) => {
            debug!(href, error = %err, "dropping unresolvable link");
            String::new()
        }
    }
}

/// On-disk capture of one listing, as stored under `fixtures/<source_id>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingFixture {
    pub source_id: String,
    pub captured_from_url: String,
    pub records: Vec<FixtureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub title: String,
    /// Literal date text, parsed the same way a live listing would be.
    #[serde(default)]
    pub date: Option<String>,
    /// Alternative to `date`: the event starts this many days after the run's
    /// date, at `start_time` (default midnight UTC).
    #[serde(default)]
    pub starts_in_days: Option<i64>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub ticket_url: String,
}

impl FixtureRecord {
    fn occurs_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(days) = self.starts_in_days {
            let day = now.date_naive() + Duration::days(days);
            return Some(day.and_time(self.start_time.unwrap_or(NaiveTime::MIN)).and_utc());
        }
        self.date
            .as_deref()
            .and_then(|text| parse_listing_date(text, now))
    }
}

#[derive(Debug)]
pub struct FixtureCollector {
    source_id: String,
    path: PathBuf,
    base_url: Url,
    clock: SharedClock,
}

impl FixtureCollector {
    pub fn new(
        source_id: impl Into<String>,
        path: impl Into<PathBuf>,
        base_url: Url,
        clock: SharedClock,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            base_url,
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub async fn load_listing_fixture(path: &Path) -> Result<ListingFixture, CollectorError> {
    let fixture_err = |message: String| CollectorError::Fixture {
        path: path.to_path_buf(),
        message,
    };
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| fixture_err(format!("reading: {e}")))?;
    serde_json::from_str(&data).map_err(|e| fixture_err(format!("parsing: {e}")))
}

#[async_trait]
impl Collector for FixtureCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn scrape(&self) -> Result<Vec<RawCandidate>, CollectorError> {
        let fixture = load_listing_fixture(&self.path).await?;
        if fixture.source_id != self.source_id {
            return Err(CollectorError::Fixture {
                path: self.path.clone(),
                message: format!(
                    "fixture belongs to {}, expected {}",
                    fixture.source_id, self.source_id
                ),
            });
        }

        let now = self.clock.now();
        let candidates: Vec<RawCandidate> = fixture
            .records
            .iter()
            .map(|record| RawCandidate {
                source_id: self.source_id.clone(),
                title: record.title.clone(),
                occurs_at: record.occurs_at(now),
                location: record.location.clone(),
                description: record.description.clone(),
                image_url: absolute_url(&self.base_url, &record.image_url),
                ticket_url: absolute_url(&self.base_url, &record.ticket_url),
            })
            .collect();

        info!(
            source_id = %self.source_id,
            path = %self.path.display(),
            count = candidates.len(),
            "replayed listing fixture"
        );
        Ok(candidates)
    }
}

#[derive(Debug)]
pub struct HtmlListingCollector {
    source_id: String,
    base_url: Url,
    listing_urls: Vec<String>,
    selectors: ListingSelectors,
    http: Arc<HttpFetcher>,
    clock: SharedClock,
}

#[async_trait]
impl Collector for HtmlListingCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn scrape(&self) -> Result<Vec<RawCandidate>, CollectorError> {
        let mut candidates = Vec::new();
        for listing_url in &self.listing_urls {
            let url = absolute_url(&self.base_url, listing_url);
            if url.is_empty() {
                return Err(CollectorError::Message(format!(
                    "unresolvable listing url {listing_url}"
                )));
            }
            let body = self.http.fetch_text(&self.source_id, &url).await?;
            let page_base = Url::parse(&url).unwrap_or_else(|_| self.base_url.clone());
            let mut parsed = parse_listing_html(
                &body,
                &self.selectors,
                &self.source_id,
                &page_base,
                self.clock.now(),
            )?;
            debug!(source_id = %self.source_id, url, count = parsed.len(), "parsed listing page");
            candidates.append(&mut parsed);
        }
        info!(source_id = %self.source_id, count = candidates.len(), "scraped html listing");
        Ok(candidates)
    }
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    date: Selector,
    location: Selector,
    description: Option<Selector>,
    image: Option<Selector>,
    link: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, CollectorError> {
    Selector::parse(selector).map_err(|e| CollectorError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_opt(selector: Option<&str>) -> Result<Option<Selector>, CollectorError> {
    selector.map(compile).transpose()
}

impl CompiledSelectors {
    fn new(selectors: &ListingSelectors) -> Result<Self, CollectorError> {
        Ok(Self {
            item: compile(&selectors.item)?,
            title: compile(&selectors.title)?,
            date: compile(&selectors.date)?,
            location: compile(&selectors.location)?,
            description: compile_opt(selectors.description.as_deref())?,
            image: compile_opt(selectors.image.as_deref())?,
            link: compile_opt(selectors.link.as_deref())?,
        })
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> String {
    scope
        .select(selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

fn select_first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::to_string)
}

/// Extract one candidate per `selectors.item` match. Fields that are missing in
/// the markup come back empty and are left to candidate validation.
pub fn parse_listing_html(
    html: &str,
    selectors: &ListingSelectors,
    source_id: &str,
    page_url: &Url,
    now: DateTime<Utc>,
) -> Result<Vec<RawCandidate>, CollectorError> {
    let compiled = CompiledSelectors::new(selectors)?;
    let document = Html::parse_document(html);

    let candidates = document
        .select(&compiled.item)
        .map(|card| {
            let date_text = match &selectors.date_attr {
                Some(attr) => select_first_attr(card, &compiled.date, attr)
                    .unwrap_or_else(|| select_first_text(card, &compiled.date)),
                None => select_first_text(card, &compiled.date),
            };
            let description = compiled
                .description
                .as_ref()
                .map(|sel| select_first_text(card, sel))
                .unwrap_or_default();
            let image_url = compiled
                .image
                .as_ref()
                .and_then(|sel| select_first_attr(card, sel, "src"))
                .map(|src| absolute_url(page_url, &src))
                .unwrap_or_default();
            let ticket_url = compiled
                .link
                .as_ref()
                .and_then(|sel| select_first_attr(card, sel, "href"))
                .map(|href| absolute_url(page_url, &href))
                .unwrap_or_default();

            RawCandidate {
                source_id: source_id.to_string(),
                title: select_first_text(card, &compiled.title),
                occurs_at: parse_listing_date(&date_text, now),
                location: select_first_text(card, &compiled.location),
                description,
                image_url,
                ticket_url,
            }
        })
        .collect();
    Ok(candidates)
}
