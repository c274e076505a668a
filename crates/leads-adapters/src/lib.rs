//! Listing adapters: fetch an inquiry page and normalize its items into lead drafts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leads_core::{LeadDraft, ListingFields, NO_DESCRIPTION};
use leads_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "leads-adapters";

/// Link prefixes that are already absolute and are used unchanged.
const ABSOLUTE_PREFIXES: [&str; 2] = ["http://", "https://"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Final URL of the page after redirects.
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn from_html(url: impl Into<String>, html: &str) -> Self {
        Self {
            url: url.into(),
            body: html.to_string(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// CSS selectors locating inquiry items and their parts on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    pub link: String,
    pub description: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: "div.inquiry".to_string(),
            title: "h2".to_string(),
            link: "a".to_string(),
            description: "p.description".to_string(),
        }
    }
}

/// Raw parts pulled out of one listing item, before any policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedListing {
    /// One draft per usable item, in page order.
    pub drafts: Vec<LeadDraft>,
    /// Items dropped for lacking a title or a link.
    pub skipped: usize,
}

#[async_trait]
pub trait ListingAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<ParsedListing, AdapterError>;
}

#[derive(Debug, Clone)]
struct CompiledSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    description: Selector,
}

fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("invalid selector {selector:?}: {e}")))
}

/// HTML adapter for pages listing inquiries as repeated item blocks.
#[derive(Debug, Clone)]
pub struct InquiryListingAdapter {
    source_id: String,
    selectors: CompiledSelectors,
}

impl InquiryListingAdapter {
    pub fn new(source_id: impl Into<String>, selectors: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            source_id: source_id.into(),
            selectors: CompiledSelectors {
                item: compile_selector(&selectors.item)?,
                title: compile_selector(&selectors.title)?,
                link: compile_selector(&selectors.link)?,
                description: compile_selector(&selectors.description)?,
            },
        })
    }

    pub fn extract_items(&self, document: &Html) -> Vec<ListingItem> {
        document
            .select(&self.selectors.item)
            .map(|item| ListingItem {
                title: item.select(&self.selectors.title).next().map(stripped_text),
                link: item
                    .select(&self.selectors.link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .and_then(|href| text_or_none(href.to_string())),
                description: item
                    .select(&self.selectors.description)
                    .next()
                    .map(stripped_text),
            })
            .collect()
    }
}

#[async_trait]
impl ListingAdapter for InquiryListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http.fetch(&target.url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<ParsedListing, AdapterError> {
        let document = Html::parse_document(&page.body);

        let mut parsed = ParsedListing::default();
        for item in self.extract_items(&document) {
            match normalize_item(item, &page.url, Utc::now()) {
                Ok(draft) => parsed.drafts.push(draft),
                Err(item) => {
                    warn!(
                        source_id = %self.source_id,
                        title = item.title.as_deref().unwrap_or("<none>"),
                        link = item.link.as_deref().unwrap_or("<none>"),
                        "skipping listing item, missing title or link"
                    );
                    parsed.skipped += 1;
                }
            }
        }
        debug!(
            source_id = %self.source_id,
            drafts = parsed.drafts.len(),
            skipped = parsed.skipped,
            "parsed listing"
        );
        Ok(parsed)
    }
}

/// Turn one extracted item into a scraper lead draft.
///
/// Items without a title or a link are handed back unchanged as `Err` so the
/// caller can count and log them; they are not failures.
pub fn normalize_item(
    item: ListingItem,
    page_url: &str,
    timestamp: DateTime<Utc>,
) -> Result<LeadDraft, ListingItem> {
    let (Some(title), Some(link)) = (item.title.as_ref(), item.link.as_ref()) else {
        return Err(item);
    };
    let listing = ListingFields {
        title: title.clone(),
        url: resolve_link(page_url, link),
        description: item
            .description
            .clone()
            .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
    };
    Ok(LeadDraft::from_listing(listing, timestamp))
}

/// Resolve `href` against the origin (scheme + host + port) of `page_url`.
pub fn resolve_link(page_url: &str, href: &str) -> String {
    if is_absolute(href) {
        return href.to_string();
    }
    let origin = page_origin(page_url);
    if href.starts_with('/') {
        format!("{origin}{href}")
    } else {
        format!("{origin}/{href}")
    }
}

fn is_absolute(href: &str) -> bool {
    ABSOLUTE_PREFIXES.iter().any(|prefix| {
        href.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

fn page_origin(page_url: &str) -> String {
    match Url::parse(page_url) {
        Ok(url) if url.origin().is_tuple() => url.origin().ascii_serialization(),
        _ => {
            // Unparseable page URL: keep "<scheme>//<authority>".
            let parts = page_url.split('/').collect::<Vec<_>>();
            match (parts.first(), parts.get(2)) {
                (Some(scheme), Some(authority)) => format!("{scheme}//{authority}"),
                _ => page_url.trim_end_matches('/').to_string(),
            }
        }
    }
}

/// Trim every text node and join the non-empty pieces.
fn stripped_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<String>()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
