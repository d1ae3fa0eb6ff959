//! Axum JSON front door for ingestion runs and owner-scoped reads.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use lpi_storage::{Store, StoreError};
use lpi_sync::{IngestionError, IngestionRequest, IngestionRunner};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpi-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<IngestionRunner>,
    pub default_window_days: u32,
}

impl AppState {
    pub fn new(runner: IngestionRunner, default_window_days: u32) -> Self {
        Self {
            runner: Arc::new(runner),
            default_window_days,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub oab_number: String,
    pub oab_state: String,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ReprocessBody {
    pub publication_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/owners/{owner_id}/ingestions", post(ingest_handler))
        .route("/owners/{owner_id}/reprocess", post(reprocess_handler))
        .route(
            "/owners/{owner_id}/publications/{id}/read",
            post(mark_read_handler),
        )
        .route("/owners/{owner_id}/publications", get(publications_handler))
        .route("/owners/{owner_id}/processes", get(processes_handler))
        .route("/owners/{owner_id}/clients", get(clients_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let (config, runner) = lpi_sync::runner_from_env().await?;
    let state = AppState::new(runner, config.default_window_days);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "lpi-web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    Json(body): Json<IngestBody>,
) -> Response {
    if body.oab_number.trim().is_empty() || body.oab_state.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "oab_number and oab_state are required");
    }
    let request = match ingestion_request(owner_id, body, state.default_window_days) {
        Ok(request) => request,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    match state.runner.run_ingestion(&request).await {
        Ok(report) => Json(report).into_response(),
        Err(IngestionError::Feed(err)) => {
            warn!(owner_id = %request.owner_id, error = %err, "ingestion aborted by feed");
            error_response(StatusCode::BAD_GATEWAY, err)
        }
    }
}

fn ingestion_request(
    owner_id: String,
    body: IngestBody,
    window_days: u32,
) -> Result<IngestionRequest, String> {
    let date_to = body.date_to.unwrap_or_else(|| Utc::now().date_naive());
    let mut request =
        IngestionRequest::last_days(owner_id, body.oab_number, body.oab_state, window_days, date_to);
    if let Some(date_from) = body.date_from {
        request.date_from = date_from;
    }
    if request.date_from > request.date_to {
        return Err(format!(
            "date_from {} is after date_to {}",
            request.date_from, request.date_to
        ));
    }
    Ok(request)
}

async fn reprocess_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    Json(body): Json<ReprocessBody>,
) -> Response {
    let report = state
        .runner
        .reprocess(&owner_id, &body.publication_ids)
        .await;
    Json(report).into_response()
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path((owner_id, id)): Path<(String, Uuid)>,
) -> Response {
    match state.runner.store().mark_publication_read(&owner_id, id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "publication not found"),
        Err(err) => store_error(err),
    }
}

async fn publications_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Response {
    match state.runner.store().list_publications(&owner_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn processes_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Response {
    match state.runner.store().list_processes(&owner_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn clients_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Response {
    match state.runner.store().list_clients(&owner_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
}
