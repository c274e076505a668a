//! Ingestion orchestration: form submissions and scrape batches into the lead store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use leads_adapters::{InquiryListingAdapter, ListingAdapter, ListingSelectors, ListingTarget};
use leads_core::LeadDraft;
use leads_storage::{HttpClientConfig, HttpFetcher, InsertOutcome, LeadStore, StoreConfig, StoreError};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leads-ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub source_id: String,
    pub listing_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub selectors: ListingSelectors,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://leads.db".to_string(),
            source_id: "moving-inquiries".to_string(),
            listing_url: "https://example.com/moving-inquiries".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            http_timeout_secs: 10,
            scheduler_enabled: false,
            scrape_cron: "0 0 */6 * * *".to_string(),
            selectors: ListingSelectors::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("LEADS_DATABASE_URL").unwrap_or(defaults.database_url),
            source_id: std::env::var("LEADS_SOURCE_ID").unwrap_or(defaults.source_id),
            listing_url: std::env::var("LEADS_LISTING_URL").unwrap_or(defaults.listing_url),
            user_agent: std::env::var("LEADS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("LEADS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("LEADS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            scrape_cron: std::env::var("LEADS_SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
            selectors: defaults.selectors,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone())
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Result of pushing one draft at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftOutcome {
    Created { id: i64 },
    Duplicate,
    MissingDetails,
}

/// Fingerprint a draft under its source's rule and insert it if absent.
pub async fn store_draft(store: &LeadStore, draft: LeadDraft) -> Result<DraftOutcome, StoreError> {
    let key = draft.identity_key();
    let Some(lead) = draft.into_new_lead() else {
        return Ok(DraftOutcome::MissingDetails);
    };
    Ok(match store.insert_if_absent(&lead, &key).await? {
        InsertOutcome::Created { id } => DraftOutcome::Created { id },
        InsertOutcome::Duplicate => DraftOutcome::Duplicate,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalCause {
    Storage,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidPayload,
    MissingFields,
    DuplicateLead,
    InternalError(InternalCause),
}

impl RejectReason {
    pub fn status_code(&self) -> u16 {
        match self {
            RejectReason::InvalidPayload | RejectReason::MissingFields => 400,
            RejectReason::DuplicateLead => 409,
            RejectReason::InternalError(_) => 500,
        }
    }

    /// Caller-facing text. Never carries internal error detail.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::InvalidPayload => "Invalid JSON payload",
            RejectReason::MissingFields => {
                "Missing required fields: name, email, and details are required."
            }
            RejectReason::DuplicateLead => "Duplicate lead",
            RejectReason::InternalError(InternalCause::Storage) => "Database operation failed",
            RejectReason::InternalError(InternalCause::Unexpected) => {
                "An internal server error occurred"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormOutcome {
    Accepted { id: i64 },
    Rejected(RejectReason),
}

/// A validated form payload: all three fields present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSubmission {
    pub name: String,
    pub email: String,
    pub details: String,
}

impl FormSubmission {
    /// Validate a raw request body.
    ///
    /// Anything that is not a non-empty JSON object is `InvalidPayload`. A
    /// field that is absent, not a string, or empty is `MissingFields`.
    pub fn parse(body: &[u8]) -> Result<Self, RejectReason> {
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|_| RejectReason::InvalidPayload)?;
        let object = match value {
            JsonValue::Object(map) if !map.is_empty() => map,
            _ => return Err(RejectReason::InvalidPayload),
        };

        match (
            required_text(&object, "name"),
            required_text(&object, "email"),
            required_text(&object, "details"),
        ) {
            (Some(name), Some(email), Some(details)) => Ok(Self {
                name,
                email,
                details,
            }),
            _ => Err(RejectReason::MissingFields),
        }
    }

    pub fn into_draft(self, timestamp: DateTime<Utc>) -> LeadDraft {
        LeadDraft::from_form(self.name, self.email, self.details, timestamp)
    }
}

fn required_text(object: &Map<String, JsonValue>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Form path: validate, fingerprint (email + details), insert if absent.
pub async fn ingest_form_submission(store: &LeadStore, body: &[u8]) -> FormOutcome {
    let submission = match FormSubmission::parse(body) {
        Ok(submission) => submission,
        Err(reason) => {
            debug!(reason = reason.message(), "form submission rejected");
            return FormOutcome::Rejected(reason);
        }
    };
    submit_form_lead(store, submission).await
}

pub async fn submit_form_lead(store: &LeadStore, submission: FormSubmission) -> FormOutcome {
    let email = submission.email.clone();
    let draft = submission.into_draft(Utc::now());
    let key = draft.identity_key();

    match store_draft(store, draft).await {
        Ok(DraftOutcome::Created { id }) => {
            info!(id, %email, unique_hash = %key, "lead saved");
            FormOutcome::Accepted { id }
        }
        Ok(DraftOutcome::Duplicate) => {
            info!(%email, unique_hash = %key, "duplicate lead detected");
            FormOutcome::Rejected(RejectReason::DuplicateLead)
        }
        Ok(DraftOutcome::MissingDetails) => FormOutcome::Rejected(RejectReason::MissingFields),
        Err(err) => {
            error!(%email, error = %err, "database error while saving lead");
            FormOutcome::Rejected(RejectReason::InternalError(InternalCause::Storage))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveSummary {
    /// Candidates handed to the batch.
    pub processed: usize,
    pub saved: usize,
    pub duplicates: usize,
    /// Candidates without `details`.
    pub unprocessed: usize,
    /// Candidates lost to a storage fault.
    pub failed: usize,
}

/// Scrape path: store each candidate independently, in order.
///
/// A storage fault on one candidate is logged and counted; the rest of the
/// batch still runs.
pub async fn save_leads(store: &LeadStore, drafts: Vec<LeadDraft>) -> SaveSummary {
    let mut summary = SaveSummary {
        processed: drafts.len(),
        ..Default::default()
    };

    for draft in drafts {
        let preview = details_preview(draft.details.as_deref());
        match store_draft(store, draft).await {
            Ok(DraftOutcome::Created { id }) => {
                summary.saved += 1;
                info!(id, details = %preview, "saved new lead");
            }
            Ok(DraftOutcome::Duplicate) => {
                summary.duplicates += 1;
                debug!(details = %preview, "skipped duplicate lead");
            }
            Ok(DraftOutcome::MissingDetails) => {
                summary.unprocessed += 1;
                warn!("skipped lead with missing details");
            }
            Err(err) => {
                summary.failed += 1;
                error!(details = %preview, error = %err, "error saving lead");
            }
        }
    }

    info!(
        processed = summary.processed,
        saved = summary.saved,
        "scrape batch stored"
    );
    summary
}

fn details_preview(details: Option<&str>) -> String {
    details.unwrap_or_default().chars().take(100).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub listing_url: String,
    pub fetch_failed: bool,
    pub skipped_items: usize,
    pub save: SaveSummary,
}

impl ScrapeRunSummary {
    pub fn considered(&self) -> usize {
        self.save.processed
    }

    pub fn saved(&self) -> usize {
        self.save.saved
    }
}

pub struct ScrapePipeline {
    target: ListingTarget,
    http: HttpFetcher,
    adapter: Box<dyn ListingAdapter>,
    store: LeadStore,
}

impl ScrapePipeline {
    pub fn new(config: &IngestConfig, store: LeadStore) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let adapter = InquiryListingAdapter::new(config.source_id.clone(), &config.selectors)
            .context("building listing adapter")?;
        Ok(Self::with_adapter(
            ListingTarget {
                url: config.listing_url.clone(),
            },
            http,
            Box::new(adapter),
            store,
        ))
    }

    pub fn with_adapter(
        target: ListingTarget,
        http: HttpFetcher,
        adapter: Box<dyn ListingAdapter>,
        store: LeadStore,
    ) -> Self {
        Self {
            target,
            http,
            adapter,
            store,
        }
    }

    pub fn store(&self) -> &LeadStore {
        &self.store
    }

    /// One sweep: fetch the listing once, normalize, store candidates in page order.
    ///
    /// A failed fetch is an expected transient condition and yields an empty
    /// summary with `fetch_failed` set rather than an error.
    pub async fn run_once(&self) -> Result<ScrapeRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let source_id = self.adapter.source_id().to_string();
        let span = info_span!("scrape_run", %run_id, source_id = %source_id);

        async move {
            let mut summary = ScrapeRunSummary {
                run_id,
                started_at,
                finished_at: started_at,
                source_id,
                listing_url: self.target.url.clone(),
                fetch_failed: false,
                skipped_items: 0,
                save: SaveSummary::default(),
            };

            let page = match self.adapter.fetch_listing(&self.http, &self.target).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(url = %self.target.url, error = %err, "listing fetch failed, no leads this cycle");
                    summary.fetch_failed = true;
                    summary.finished_at = Utc::now();
                    return Ok(summary);
                }
            };

            let parsed = self
                .adapter
                .parse_listing(&page)
                .with_context(|| format!("parsing listing {}", page.url))?;
            summary.skipped_items = parsed.skipped;
            summary.save = save_leads(&self.store, parsed.drafts).await;
            summary.finished_at = Utc::now();

            info!(
                considered = summary.considered(),
                saved = summary.saved(),
                skipped = summary.skipped_items,
                "scrape run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Cron-driven sweeps. Returns `None` when the scheduler is disabled.
///
/// Ticks that arrive while a sweep is still running are dropped.
pub async fn maybe_build_scheduler(
    pipeline: Arc<ScrapePipeline>,
    config: &IngestConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    let cron = config.scrape_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous scrape run still in progress, skipping tick");
                return;
            };
            if let Err(err) = pipeline.run_once().await {
                error!(error = %err, "scheduled scrape run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_scrape_once_from_env() -> Result<ScrapeRunSummary> {
    let config = IngestConfig::from_env();
    let store = LeadStore::open(&config.store_config())
        .await
        .with_context(|| format!("opening lead store {}", config.database_url))?;
    let pipeline = ScrapePipeline::new(&config, store)?;
    let summary = pipeline.run_once().await;
    pipeline.store().close().await;
    summary
}
