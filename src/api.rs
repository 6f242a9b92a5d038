//! HTTP surface.
//!
//! JSON everywhere, bodies capped at 5 MiB. Chain-observer endpoints accept
//! whatever the node posts and answer 200 even for payloads that yield no
//! events; request errors map to `{ok:false, error}` with the status from
//! the error taxonomy.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, error};

use crate::cosigner::{CoSignerService, SignRequest};
use crate::error::WatchtowerError;
use crate::metrics::Metrics;
use crate::watchtower::Watchtower;

const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 500;

static APP_INDEX_HTML: &str = include_str!("../static/index.html");
static APP_MAIN_JS: &str = include_str!("../static/main.js");
static APP_STYLES_CSS: &str = include_str!("../static/styles.css");

#[derive(Clone)]
pub struct AppState {
    pub tower: Arc<Watchtower>,
    pub cosigner: Option<Arc<CoSignerService>>,
    pub metrics: Arc<Metrics>,
    pub log_raw_events: bool,
}

pub struct ApiError(WatchtowerError);

impl From<WatchtowerError> for ApiError {
    fn from(err: WatchtowerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, "request rejected");
        }
        (status, Json(json!({ "ok": false, "error": self.0.reason() }))).into_response()
    }
}

type ApiResult<T = Json<JsonValue>> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    principal: Option<String>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
}

fn parse_body(body: &Bytes) -> Result<JsonValue, WatchtowerError> {
    serde_json::from_slice(body)
        .map_err(|e| WatchtowerError::Ingest(format!("request body is not JSON: {e}")))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/closures", get(list_closures))
        .route("/signature-states", get(list_signature_states).post(post_signature_state))
        .route("/pipes", get(list_pipes))
        .route("/dispute-attempts", get(list_dispute_attempts))
        .route("/events", get(list_events))
        .route("/counterparty/transfer", post(counterparty_transfer))
        .route(
            "/counterparty/signature-request",
            post(counterparty_signature_request),
        )
        .route("/new_block", post(new_block))
        .route("/new_burn_block", post(new_burn_block))
        .route("/new_mempool_tx", post(ignored))
        .route("/drop_mempool_tx", post(ignored))
        .route("/new_microblocks", post(ignored))
        .route("/app", get(app_index))
        .route("/app/index.html", get(app_index))
        .route("/app/main.js", get(app_main_js))
        .route("/app/styles.css", get(app_styles))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let counts = state.tower.counts().await?;
    Ok(Json(json!({
        "ok": true,
        "status": "ok",
        "counts": counts,
    })))
}

async fn metrics(State(state): State<AppState>) -> Response {
    if let Ok(counts) = state.tower.counts().await {
        state.metrics.closures_active.set(counts.closures);
        state.metrics.dispute_attempts.set(counts.dispute_attempts);
    }
    match state.metrics.render() {
        Ok(buffer) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
        }
    }
}

async fn list_closures(State(state): State<AppState>) -> ApiResult {
    let closures = state.tower.store().list_closures().await?;
    Ok(Json(json!({ "ok": true, "closures": closures })))
}

async fn list_signature_states(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit);
    let states = state.tower.store().list_signature_states(limit as i64).await?;
    Ok(Json(json!({ "ok": true, "signatureStates": states })))
}

async fn list_pipes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit);
    let pipes = state
        .tower
        .merged_pipes(limit, query.principal.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "pipes": pipes })))
}

async fn list_dispute_attempts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit);
    let attempts = state.tower.store().list_dispute_attempts(limit as i64).await?;
    Ok(Json(json!({ "ok": true, "disputeAttempts": attempts })))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit);
    let events = state.tower.store().list_recent_events(limit as i64).await?;
    Ok(Json(json!({ "ok": true, "events": events })))
}

async fn post_signature_state(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let payload = parse_body(&body)?;
    let input = serde_json::from_value(payload)
        .map_err(|e| WatchtowerError::Validation(format!("invalid signature state: {e}")))?;

    let outcome = match state.tower.upsert_signature_state(input, false).await {
        Ok(outcome) => outcome,
        Err(err) => {
            state.metrics.signature_state_rejections_total.inc();
            return Err(err.into());
        }
    };
    if !outcome.stored {
        state.metrics.signature_state_rejections_total.inc();
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "ok": false,
                "error": outcome.reason,
                "stored": false,
                "replaced": false,
                "state": outcome.state,
            })),
        )
            .into_response());
    }
    state.metrics.signature_state_upserts_total.inc();
    Ok(Json(json!({
        "ok": true,
        "stored": outcome.stored,
        "replaced": outcome.replaced,
        "state": outcome.state,
    }))
    .into_response())
}

async fn counterparty_transfer(State(state): State<AppState>, body: Bytes) -> ApiResult {
    counterparty(state, body, true).await
}

async fn counterparty_signature_request(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult {
    counterparty(state, body, false).await
}

async fn counterparty(state: AppState, body: Bytes, transfer: bool) -> ApiResult {
    state.metrics.cosign_requests_total.inc();
    let Some(cosigner) = &state.cosigner else {
        state.metrics.cosign_failures_total.inc();
        return Err(WatchtowerError::CoSigner("signing not configured".into()).into());
    };

    let payload = parse_body(&body)?;
    let request: SignRequest = serde_json::from_value(payload)
        .map_err(|e| WatchtowerError::Validation(format!("invalid co-sign request: {e}")))?;

    let result = if transfer {
        cosigner.sign_transfer(request).await
    } else {
        cosigner.sign_signature_request(request).await
    };
    match result {
        Ok(response) => Ok(Json(json!({
            "ok": true,
            "request": response.request,
            "mySignature": response.my_signature,
            "upsert": response.upsert,
        }))),
        Err(err) => {
            state.metrics.cosign_failures_total.inc();
            Err(err.into())
        }
    }
}

async fn new_block(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let payload = parse_body(&body)?;
    if state.log_raw_events {
        debug!(payload = %payload, "raw /new_block payload");
    }
    let outcome = state.tower.ingest(&payload, "new_block").await?;
    state
        .metrics
        .events_ingested_total
        .inc_by(outcome.observed_events as u64);
    Ok(Json(json!({
        "ok": true,
        "observedEvents": outcome.observed_events,
        "activeClosures": outcome.active_closures,
    })))
}

async fn new_burn_block(State(state): State<AppState>, body: Bytes) -> ApiResult {
    state.metrics.burn_blocks_total.inc();
    let payload = parse_body(&body)?;
    let burn_height = ["burn_block_height", "burnBlockHeight", "burn_height"]
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });
    let Some(burn_height) = burn_height else {
        return Ok(Json(json!({ "ok": true, "ignored": true })));
    };

    let expired = state
        .tower
        .ingest_burn_block(burn_height, "new_burn_block")
        .await?;
    state.metrics.expired_closures_total.inc_by(expired as u64);
    Ok(Json(json!({
        "ok": true,
        "burnHeight": burn_height,
        "expiredClosures": expired,
    })))
}

async fn ignored() -> Json<JsonValue> {
    Json(json!({ "ok": true, "ignored": true }))
}

async fn app_index() -> Response {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], APP_INDEX_HTML).into_response()
}

async fn app_main_js() -> Response {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        APP_MAIN_JS,
    )
        .into_response()
}

async fn app_styles() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_STYLES_CSS).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": "not-found" })),
    )
        .into_response()
}
