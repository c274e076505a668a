//! Axum HTTP surface for lead intake.

use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leads_ingest::{ingest_form_submission, FormOutcome, InternalCause, RejectReason};
use leads_storage::{LeadStore, StoreConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "leads-web";

#[derive(Clone)]
pub struct AppState {
    pub store: LeadStore,
}

impl AppState {
    pub fn new(store: LeadStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub database_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            database_url: "sqlite://leads.db".to_string(),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("LEADS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database_url: std::env::var("LEADS_DATABASE_URL").unwrap_or(defaults.database_url),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/leads", post(add_lead_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Bind `0.0.0.0:{port}` and serve until the process stops.
pub async fn serve(config: &WebConfig, store: LeadStore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "lead intake listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let store = LeadStore::open(&config.store_config())
        .await
        .with_context(|| format!("opening lead store {}", config.database_url))?;
    serve(&config, store).await
}

async fn add_lead_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    outcome_response(ingest_form_submission(&state.store, &body).await)
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn outcome_response(outcome: FormOutcome) -> Response {
    match outcome {
        FormOutcome::Accepted { .. } => {
            (StatusCode::CREATED, Json(json!({"status": "Lead saved"}))).into_response()
        }
        FormOutcome::Rejected(reason) => reject_response(reason),
    }
}

fn reject_response(reason: RejectReason) -> Response {
    let status =
        StatusCode::from_u16(reason.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match reason {
        RejectReason::DuplicateLead => json!({"status": reason.message()}),
        _ => json!({"error": reason.message()}),
    };
    (status, Json(body)).into_response()
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("handler panicked");
    reject_response(RejectReason::InternalError(InternalCause::Unexpected))
}
