mod config;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{get, post, put},
};
pub use config::{AppConfig, CatalogConfig, ConfigError};
use pointledger_shared::api;
use pointledger_shared::domain::{AchievementRule, Level, LevelTier, TransactionKind};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info_span;
use uuid::Uuid;

use crate::engine::Predicate;
use crate::storage::{ProgressRow, StorageError};

type ChildLockMap = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    // Per-child serialization of the ingest chain; different children
    // proceed in parallel.
    children_locks: ChildLockMap,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        Self {
            config,
            store,
            children_locks: Default::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn child_mutex(&self, child_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.children_locks.lock().await;
        map.entry(child_id.to_string())
            .or_insert_with(Default::default)
            .clone()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/children", get(api_list_children))
        .route(
            "/api/children/{id}/transactions",
            post(api_record_transaction),
        )
        .route(
            "/api/children/{id}/transactions",
            get(api_list_transactions),
        )
        .route("/api/children/{id}/progress", get(api_progress))
        .route("/api/children/{id}/achievements", get(api_list_achievements))
        .route("/api/catalog", get(api_get_catalog))
        .route("/api/catalog/rules/{key}", put(api_put_rule))
        .route("/api/catalog/levels/{level}", put(api_put_level))
        .route("/api/reconcile", post(api_reconcile))
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    // Call next
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn api_list_children(
    State(state): State<AppState>,
) -> Result<Json<Vec<api::ChildDto>>, AppError> {
    let rows = state.store.list_children().await.map_err(storage_err)?;
    let items = rows
        .into_iter()
        .map(|c| api::ChildDto {
            id: c.id,
            family_id: c.family_id,
            display_name: c.display_name,
        })
        .collect();
    Ok(Json(items))
}

#[derive(Deserialize)]
struct ChildPathId {
    id: String,
}

/// Ingest: record a committed point event and run the engine chain for it
/// synchronously. The per-child lock serializes concurrent ingests for the
/// same child so two racing awards cannot both read stale aggregates.
async fn api_record_transaction(
    State(state): State<AppState>,
    Path(p): Path<ChildPathId>,
    Json(body): Json<api::TransactionReq>,
) -> Result<Json<api::TransactionResp>, AppError> {
    match (body.kind, body.amount) {
        (_, 0) => return Err(AppError::bad_request("amount must be non-zero")),
        (TransactionKind::Award, a) if a < 0 => {
            return Err(AppError::bad_request("award amount must be positive"));
        }
        (TransactionKind::Redemption, a) if a > 0 => {
            return Err(AppError::bad_request("redemption amount must be negative"));
        }
        _ => {}
    }

    let child_mutex = state.child_mutex(&p.id).await;
    let _guard = child_mutex.lock().await;

    let outcome = state
        .store
        .record_transaction(&p.id, body.amount, body.kind, body.reason.as_deref())
        .await
        .map_err(storage_err)?;
    if !outcome.unlocked.is_empty() {
        tracing::info!(child_id = %p.id, unlocked = ?outcome.unlocked, "achievements unlocked");
    }
    Ok(Json(api::TransactionResp {
        progress: progress_dto(outcome.progress),
        unlocked: outcome.unlocked,
    }))
}

async fn api_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<api::ProgressDto>, AppError> {
    let row = state.store.get_progress(&id).await.map_err(storage_err)?;
    Ok(Json(progress_dto(row)))
}

async fn api_list_achievements(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<api::AchievementDto>>, AppError> {
    if !state.store.child_exists(&id).await.map_err(storage_err)? {
        return Err(AppError::not_found(format!("child not found: {}", id)));
    }
    let rows = state
        .store
        .list_achievements(&id)
        .await
        .map_err(storage_err)?;
    let items = rows
        .into_iter()
        .map(|a| api::AchievementDto {
            kind: a.kind,
            title: a.title,
            description: a.description,
            icon: a.icon,
            unlocked_at: chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                a.unlocked_at,
                chrono::Utc,
            )
            .to_rfc3339(),
        })
        .collect();
    Ok(Json(items))
}

#[derive(Deserialize)]
struct PageOpts {
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn api_list_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(opts): Query<PageOpts>,
) -> Result<Json<Vec<api::TransactionHistoryItemDto>>, AppError> {
    if !state.store.child_exists(&id).await.map_err(storage_err)? {
        return Err(AppError::not_found(format!("child not found: {}", id)));
    }
    let page = opts.page.unwrap_or(1);
    let per_page = opts.per_page.unwrap_or(10);
    let rows = state
        .store
        .list_transactions_for_child(&id, page, per_page)
        .await
        .map_err(storage_err)?;
    let items = rows
        .into_iter()
        .map(|t| api::TransactionHistoryItemDto {
            id: t.id,
            amount: t.amount,
            kind: TransactionKind::from_str(&t.kind).unwrap_or(TransactionKind::Adjustment),
            reason: t.reason,
            time: chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                t.created_at,
                chrono::Utc,
            )
            .to_rfc3339(),
        })
        .collect();
    Ok(Json(items))
}

async fn api_get_catalog(
    State(state): State<AppState>,
) -> Result<Json<api::CatalogDto>, AppError> {
    let (levels, rules) = state.store.get_catalog().await.map_err(storage_err)?;
    Ok(Json(api::CatalogDto { levels, rules }))
}

#[derive(Deserialize)]
struct RuleKeyPath {
    key: String,
}

/// Catalog management: rules are data, applied on the next event without a
/// redeploy. Writes are validated so a typo is rejected here instead of
/// silently skipped at evaluation time.
async fn api_put_rule(
    State(state): State<AppState>,
    Path(p): Path<RuleKeyPath>,
    Json(body): Json<api::AchievementRuleReq>,
) -> Result<StatusCode, AppError> {
    Predicate::parse(&body.predicate, body.threshold)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let rule = AchievementRule {
        key: p.key,
        predicate: body.predicate,
        threshold: body.threshold,
        title: body.title,
        description: body.description,
        icon: body.icon,
    };
    state.store.upsert_rule(&rule).await.map_err(storage_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct LevelPath {
    level: String,
}

async fn api_put_level(
    State(state): State<AppState>,
    Path(p): Path<LevelPath>,
    Json(body): Json<api::LevelTierReq>,
) -> Result<StatusCode, AppError> {
    let level = Level::from_str(&p.level)
        .map_err(|_| AppError::bad_request(format!("unknown level: {}", p.level)))?;
    if body.min_total < 0 {
        return Err(AppError::bad_request("min_total must be non-negative"));
    }
    let tier = LevelTier {
        level,
        min_total: body.min_total,
    };
    state
        .store
        .upsert_level_tier(&tier)
        .await
        .map_err(storage_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reconciliation trigger. No per-child lock here: the job is idempotent
/// and its writes are inserts-if-absent and overwrites, so it is safe to
/// run concurrently with live traffic.
async fn api_reconcile(
    State(state): State<AppState>,
    body: Option<Json<api::ReconcileReq>>,
) -> Result<Json<api::ReconcileResp>, AppError> {
    let filter = body.and_then(|Json(b)| b.child_id);
    let summary = state
        .store
        .reconcile(filter.as_deref())
        .await
        .map_err(storage_err)?;
    tracing::info!(
        children_checked = summary.children_checked,
        children_corrected = summary.children_corrected,
        achievements_added = summary.achievements_added,
        "reconciliation finished"
    );
    Ok(Json(api::ReconcileResp {
        children_checked: summary.children_checked,
        children_corrected: summary.children_corrected,
        achievements_added: summary.achievements_added,
    }))
}

fn progress_dto(row: ProgressRow) -> api::ProgressDto {
    api::ProgressDto {
        child_id: row.child_id,
        total_earned: row.total_earned,
        level: row.level,
        current_streak: row.current_streak,
        longest_streak: row.longest_streak,
        last_award_date: row.last_award_date.map(|d| d.format("%Y-%m-%d").to_string()),
    }
}

fn storage_err(e: StorageError) -> AppError {
    match e {
        StorageError::Database(diesel::result::Error::NotFound) => {
            AppError::not_found("not found")
        }
        StorageError::InvalidInput(msg) => AppError::bad_request(msg),
        other => AppError::internal(other),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        // Log any error responses at ERROR level for troubleshooting
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
