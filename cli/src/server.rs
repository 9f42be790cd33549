use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::error;

use crate::commands::Store;
use vitals_core::error::StoreError;
use vitals_core::metrics::{DEFAULT_WINDOW, Dashboard};
use vitals_core::models::{Measurements, Record, validate_measurements};
use vitals_core::store::{MergeSummary, UpsertOutcome, preview_merge};
use vitals_core::wearable::parse_bundle;

const BODY_LIMIT: usize = 50 * 1024 * 1024; // 50 MB

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
struct DashboardQuery {
    window: Option<usize>,
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Serialize)]
struct ImportResponse {
    dry_run: bool,
    members_used: Vec<String>,
    #[serde(flatten)]
    summary: MergeSummary,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => Self::Conflict(
                "The health table changed while this request was being handled. Reload and retry."
                    .to_string(),
            ),
            StoreError::InvalidRecord(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.into()),
        }
    }
}

fn parse_date_param(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{raw}'. Use YYYY-MM-DD")))
}

/// Run a store operation on the blocking pool.
///
/// Backends are synchronous, and the remote one blocks on the runtime.
async fn with_store<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T, ApiError> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .context("store task panicked")?
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let from = params.from.as_deref().map(parse_date_param).transpose()?;
    let to = params.to.as_deref().map(parse_date_param).transpose()?;

    let records = with_store(&state, move |store| {
        let loaded = store.load()?;
        Ok(loaded
            .table
            .into_records()
            .into_iter()
            .filter(|r| from.is_none_or(|f| r.date >= f) && to.is_none_or(|t| r.date <= t))
            .collect())
    })
    .await?;
    Ok(Json(records))
}

async fn get_record(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
) -> Result<Json<Record>, ApiError> {
    let date = parse_date_param(&date_str)?;
    let record = with_store(&state, move |store| {
        let loaded = store.load()?;
        loaded
            .table
            .get(date)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("No record for {date_str}")))
    })
    .await?;
    Ok(Json(record))
}

async fn put_record(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
    Json(values): Json<Measurements>,
) -> Result<(StatusCode, Json<UpsertOutcome>), ApiError> {
    let date = parse_date_param(&date_str)?;
    let values = values.normalized();
    if values.is_empty() {
        return Err(ApiError::BadRequest(
            "Record has no measurements".to_string(),
        ));
    }
    validate_measurements(&values).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = with_store(&state, move |store| Ok(store.upsert(date, values)?)).await?;
    let status = if outcome.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

async fn delete_record(
    State(state): State<AppState>,
    Path(date_str): Path<String>,
) -> Result<StatusCode, ApiError> {
    let date = parse_date_param(&date_str)?;
    let deleted = with_store(&state, move |store| Ok(store.delete(date)?)).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No record for {date_str}")))
    }
}

async fn get_dashboard(
    State(state): State<AppState>,
    Query(params): Query<DashboardQuery>,
) -> Result<Json<Dashboard>, ApiError> {
    let window = params.window.unwrap_or(DEFAULT_WINDOW);
    if window == 0 {
        return Err(ApiError::BadRequest(
            "window must be at least 1".to_string(),
        ));
    }
    let dash = with_store(&state, move |store| {
        let loaded = store.load()?;
        Ok(Dashboard::compute(&loaded.table, window))
    })
    .await?;
    Ok(Json(dash))
}

async fn import_bundle(
    State(state): State<AppState>,
    Query(params): Query<ImportQuery>,
    body: Bytes,
) -> Result<Json<ImportResponse>, ApiError> {
    let bundle = parse_bundle(Cursor::new(body))
        .map_err(|e| ApiError::BadRequest(format!("Invalid wearable export: {e:#}")))?;
    let dry_run = params.dry_run;

    let rows = bundle.rows;
    let summary = with_store(&state, move |store| {
        if dry_run {
            let loaded = store.load()?;
            Ok(preview_merge(&loaded.table, &rows))
        } else {
            Ok(store.merge_external(&rows)?)
        }
    })
    .await?;

    Ok(Json(ImportResponse {
        dry_run,
        members_used: bundle.members_used,
        summary,
    }))
}

async fn export_csv(State(state): State<AppState>) -> Result<Response, ApiError> {
    let csv = with_store(&state, |store| {
        let loaded = store.load()?;
        Ok(loaded.table.to_csv()?)
    })
    .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"health.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/records", get(list_records))
        .route(
            "/api/records/{date}",
            get(get_record).put(put_record).delete(delete_record),
        )
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/import", post(import_bundle))
        .route("/api/export", get(export_csv))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four characters of the key, or a mask when it is too short
/// to abbreviate.
fn key_hint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub(crate) async fn start_server(
    store: Store,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        store: Arc::new(store),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_hint(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
