//! Lead persistence (SQLite) + HTTP fetch utilities.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use leads_core::{IdentityKey, Lead, LeadSource, NewLead};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "leads-storage";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    /// Writers are serialized through this pool; keep it at 1 for a single-writer store.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://leads.db".to_string(),
            max_connections: 1,
        }
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("corrupt lead row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created { id: i64 },
    Duplicate,
}

/// Durable lead collection with insert-if-absent semantics on the identity key.
///
/// The pool is opened once and shared; each insert runs inside its own
/// transaction which is committed or rolled back before the call returns.
#[derive(Debug, Clone)]
pub struct LeadStore {
    pool: SqlitePool,
}

impl LeadStore {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|source| StoreError::InvalidUrl {
                url: config.database_url.clone(),
                source,
            })?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap_schema().await?;
        Ok(store)
    }

    /// Ephemeral store for tests. A single connection is pinned open because
    /// every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `leads` table if missing. Safe to run on every start.
    pub async fn bootstrap_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                email TEXT,
                details TEXT NOT NULL,
                source TEXT,
                timestamp TEXT,
                unique_hash TEXT UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert `lead` unless a lead with `key` already exists.
    ///
    /// The existence check and the insert share one transaction. The engine's
    /// UNIQUE constraint on `unique_hash` is the final backstop: a violation
    /// raised by the insert itself is reported as `Duplicate`, not as an error.
    pub async fn insert_if_absent(
        &self,
        lead: &NewLead,
        key: &IdentityKey,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let outcome = match find_id_by_key(&mut tx, key).await {
            Ok(Some(_)) => Ok(InsertOutcome::Duplicate),
            Ok(None) => insert_row(&mut tx, lead, key).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(InsertOutcome::Created { id }) => {
                tx.commit().await?;
                debug!(id, unique_hash = %key, "lead row committed");
                Ok(InsertOutcome::Created { id })
            }
            Ok(InsertOutcome::Duplicate) => {
                tx.rollback().await?;
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed insert also failed");
                }
                Err(err)
            }
        }
    }

    pub async fn find_by_identity_key(&self, key: &IdentityKey) -> Result<Option<Lead>, StoreError> {
        let row = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT id, name, email, details, source, timestamp, unique_hash
              FROM leads
             WHERE unique_hash = ?
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LeadRow::into_lead).transpose()
    }

    /// Most recent leads first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<Lead>, StoreError> {
        let rows = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT id, name, email, details, source, timestamp, unique_hash
              FROM leads
             ORDER BY id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeadRow::into_lead).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn find_id_by_key(
    conn: &mut SqliteConnection,
    key: &IdentityKey,
) -> Result<Option<i64>, StoreError> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM leads WHERE unique_hash = ?")
        .bind(key.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

async fn insert_row(
    conn: &mut SqliteConnection,
    lead: &NewLead,
    key: &IdentityKey,
) -> Result<InsertOutcome, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO leads (name, email, details, source, timestamp, unique_hash)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(lead.name.as_deref())
    .bind(lead.email.as_deref())
    .bind(&lead.details)
    .bind(lead.source.as_str())
    .bind(lead.timestamp.to_rfc3339())
    .bind(key.as_str())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(InsertOutcome::Created {
            id: done.last_insert_rowid(),
        }),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Ok(InsertOutcome::Duplicate)
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, FromRow)]
struct LeadRow {
    id: i64,
    name: Option<String>,
    email: Option<String>,
    details: Option<String>,
    source: Option<String>,
    timestamp: Option<String>,
    unique_hash: Option<String>,
}

impl LeadRow {
    fn into_lead(self) -> Result<Lead, StoreError> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::CorruptRow { id, reason };

        let source = self
            .source
            .as_deref()
            .ok_or_else(|| corrupt("missing source".into()))?
            .parse::<LeadSource>()
            .map_err(|e| corrupt(e.to_string()))?;
        let timestamp = self
            .timestamp
            .as_deref()
            .ok_or_else(|| corrupt("missing timestamp".into()))
            .and_then(|raw| parse_timestamp(raw).ok_or_else(|| corrupt(format!("bad timestamp {raw:?}"))))?;
        let unique_hash = self
            .unique_hash
            .ok_or_else(|| corrupt("missing unique_hash".into()))?;

        Ok(Lead {
            id,
            name: self.name,
            email: self.email,
            details: self.details.unwrap_or_default(),
            source,
            timestamp,
            identity_key: IdentityKey::from_hex(unique_hash),
        })
    }
}

/// RFC 3339, or a naive ISO-8601 stamp (no offset) which is taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// URL after redirects; relative links on the page resolve against this.
    pub final_url: String,
    /// Decoded with the charset from `Content-Type`, UTF-8 when none is declared.
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One bounded GET. No retries: a timeout, transport error or non-2xx
    /// status is returned to the caller as is.
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            debug!(%status, bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leads_core::{generate_details_hash, generate_identity_key};
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn form_lead(email: &str, details: &str) -> NewLead {
        NewLead {
            name: Some("Test User".into()),
            email: Some(email.into()),
            details: details.into(),
            source: LeadSource::Form,
            timestamp: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn insert_then_duplicate() {
        let store = LeadStore::in_memory().await.unwrap();
        let lead = form_lead("test@example.com", "Test details");
        let key = generate_identity_key(lead.email.as_deref(), Some(&lead.details));

        let first = store.insert_if_absent(&lead, &key).await.unwrap();
        assert!(matches!(first, InsertOutcome::Created { .. }));
        let second = store.insert_if_absent(&lead, &key).await.unwrap();
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(store.count().await.unwrap(), 1);

        let stored = store.find_by_identity_key(&key).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Test User"));
        assert_eq!(stored.details, "Test details");
        assert_eq!(stored.source, LeadSource::Form);
        assert_eq!(stored.timestamp, lead.timestamp);
        assert_eq!(stored.identity_key, key);
    }

    #[tokio::test]
    async fn ids_are_sequential() {
        let store = LeadStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for details in ["one", "two", "three"] {
            let lead = form_lead("a@example.com", details);
            let key = generate_identity_key(lead.email.as_deref(), Some(details));
            match store.insert_if_absent(&lead, &key).await.unwrap() {
                InsertOutcome::Created { id } => ids.push(id),
                InsertOutcome::Duplicate => panic!("unexpected duplicate"),
            }
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn unique_violation_on_insert_reads_as_duplicate() {
        let store = LeadStore::in_memory().await.unwrap();
        let lead = form_lead("race@example.com", "same inquiry");
        let key = generate_identity_key(lead.email.as_deref(), Some(&lead.details));
        store.insert_if_absent(&lead, &key).await.unwrap();

        // Skip the existence check, as a racing writer would have.
        let mut conn = store.pool().acquire().await.unwrap();
        let outcome = insert_row(&mut conn, &lead, &key).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);
        drop(conn);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_insert_is_rolled_back_and_store_stays_usable() {
        let store = LeadStore::in_memory().await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_boom BEFORE INSERT ON leads
            WHEN NEW.details = 'boom'
            BEGIN SELECT RAISE(ABORT, 'rejected by trigger'); END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let bad = form_lead("x@example.com", "boom");
        let bad_key = generate_identity_key(bad.email.as_deref(), Some("boom"));
        let err = store.insert_if_absent(&bad, &bad_key).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.find_by_identity_key(&bad_key).await.unwrap().is_none());

        let good = form_lead("x@example.com", "fine");
        let good_key = generate_identity_key(good.email.as_deref(), Some("fine"));
        let outcome = store.insert_if_absent(&good, &good_key).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen_and_bootstrap_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("leads.db").display());
        let config = StoreConfig::new(url);

        let details = "Title: A - URL: https://example.com/a - Description: x";
        let key = generate_details_hash(Some(details));
        let lead = NewLead {
            name: None,
            email: None,
            details: details.into(),
            source: LeadSource::Scraper,
            timestamp: Utc::now(),
        };

        let store = LeadStore::open(&config).await.unwrap();
        store.insert_if_absent(&lead, &key).await.unwrap();
        store.close().await;

        let reopened = LeadStore::open(&config).await.unwrap();
        reopened.bootstrap_schema().await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert_eq!(
            reopened.insert_if_absent(&lead, &key).await.unwrap(),
            InsertOutcome::Duplicate
        );
        let stored = reopened.find_by_identity_key(&key).await.unwrap().unwrap();
        assert!(stored.name.is_none() && stored.email.is_none());
        assert_eq!(stored.source, LeadSource::Scraper);
        reopened.close().await;
    }

    #[tokio::test]
    async fn naive_timestamps_from_older_rows_read_as_utc() {
        let store = LeadStore::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO leads (name, email, details, source, timestamp, unique_hash) VALUES (NULL, NULL, 'd', 'scraper', '2024-05-01T09:30:00.123456', 'abc')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let lead = store
            .find_by_identity_key(&IdentityKey::from_hex("abc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lead.timestamp.to_rfc3339(), "2024-05-01T09:30:00.123456+00:00");
    }

    #[tokio::test]
    async fn fetch_sends_user_agent_and_reports_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moving-inquiries"))
            .and(header("user-agent", "Mozilla/5.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher
            .fetch(&format!("{}/moving-inquiries", server.uri()))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.final_url, format!("{}/moving-inquiries", server.uri()));
        assert_eq!(resp.body, "<html></html>");
    }

    #[tokio::test]
    async fn body_is_decoded_with_declared_charset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                b"<h2>Caf\xe9 move</h2>".to_vec(),
                "text/html; charset=iso-8859-1",
            ))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher.fetch(&server.uri()).await.unwrap();
        assert_eq!(resp.body, "<h2>Caf\u{e9} move</h2>");
    }

    #[tokio::test]
    async fn non_success_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            user_agent: None,
        })
        .unwrap();
        match fetcher.fetch(&server.uri()).await.unwrap_err() {
            FetchError::Request(err) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
