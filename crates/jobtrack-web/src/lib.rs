//! Axum JSON API for browsing postings and recording application progress.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobtrack_core::{NewManualPosting, PostingQuery};
use jobtrack_storage::{utc_today, PostingStore, StoreError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-web";

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PostingStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn PostingStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/postings", get(list_handler).post(create_handler))
        .route("/api/postings/{id}", axum::routing::delete(delete_handler))
        .route("/api/postings/{id}/applied", post(applied_handler))
        .route("/api/postings/{id}/status", post(status_handler))
        .route("/api/sources", get(sources_handler))
        .with_state(Arc::new(state))
}

/// `JOBTRACK_WEB_PORT`, falling back to 8000 when unset or unparsable.
pub fn port_from_env() -> u16 {
    port_from_lookup(|key| std::env::var(key).ok())
}

pub fn port_from_lookup<F>(lookup: F) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    lookup("JOBTRACK_WEB_PORT")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Serve until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "annotation api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(err) => {
                let status = match &err {
                    StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::NotManual(_) => StatusCode::FORBIDDEN,
                    StoreError::DuplicateLink(_) => StatusCode::CONFLICT,
                    _ => {
                        error!(error = %err, "store failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid id '{raw}'")))
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostingQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let postings = state.store.list(&query).await?;
    Ok(Json(json!({ "ok": true, "count": postings.len(), "postings": postings })))
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let sources = state.store.sources().await?;
    Ok(Json(json!({ "ok": true, "sources": sources })))
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewManualPosting>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.link.trim().is_empty() || body.title.trim().is_empty() {
        return Err(ApiError::BadRequest("link and title are required".into()));
    }
    let posting = body.into_posting(Uuid::new_v4(), utc_today());
    let posting = state.store.insert_manual(posting).await?;
    info!(id = %posting.id, link = %posting.link, "manual posting created");
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "posting": posting }))))
}

#[derive(Debug, Deserialize)]
struct AppliedBody {
    applied: bool,
}

async fn applied_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AppliedBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.store.set_applied(id, body.applied).await?;
    Ok(Json(json!({ "ok": true, "id": id, "applied": body.applied })))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: String,
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.store.set_status(id, &body.status).await?;
    let status = Some(body.status.trim()).filter(|s| !s.is_empty());
    Ok(Json(json!({ "ok": true, "id": id, "status": status })))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    state.store.delete_manual(id).await?;
    info!(%id, "manual posting deleted");
    Ok(Json(json!({ "ok": true, "id": id })))
}
