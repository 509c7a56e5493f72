//! HTTP request handlers.
//!
//! Every JSON answer carries a `success` flag; failures add an `error`
//! message instead of data.

use super::AppState;
use crate::db::{DbError, HistoryRecord, ProbeKind, Target, TargetFilter};
use crate::probe::ProbeError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default page size of reachability history.
const DEFAULT_HISTORY_LIMIT: u32 = 50;

fn fail(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn db_failure(err: DbError) -> Response {
    match err {
        DbError::NotFound => fail(StatusCode::NOT_FOUND, "Target not found"),
        other => {
            tracing::error!("Store error: {}", other);
            fail(StatusCode::INTERNAL_SERVER_ERROR, other)
        }
    }
}

fn probe_failure(err: ProbeError) -> Response {
    match err {
        ProbeError::Config(_) => fail(StatusCode::BAD_REQUEST, err),
        other => fail(StatusCode::BAD_GATEWAY, other),
    }
}

fn load_target(state: &AppState, id: i64) -> Result<Target, Response> {
    state.store.get_target(id).map_err(db_failure)
}

fn load_jobs_target(state: &AppState, id: i64) -> Result<Target, Response> {
    let target = load_target(state, id)?;
    if target.probe_kind != ProbeKind::Jobs {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            format!("{} is not a job scheduler", target.name),
        ));
    }
    Ok(target)
}

// ============================================================================
// Target registry
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsQuery {
    pub branch_id: Option<i64>,
    pub kind: Option<ProbeKind>,
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn handle_list_targets(
    State(state): State<AppState>,
    Query(query): Query<TargetsQuery>,
) -> Response {
    let filter = TargetFilter {
        branch_id: query.branch_id,
        kind: query.kind,
        include_inactive: query.include_inactive,
    };

    match state.store.list_targets(&filter) {
        Ok(targets) => Json(json!({ "success": true, "data": targets })).into_response(),
        Err(e) => db_failure(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRequest {
    pub name: String,
    pub address: String,
    #[serde(default = "default_kind")]
    pub probe_kind: ProbeKind,
    #[serde(default)]
    pub principal: String,
    /// Plaintext; encrypted before it is stored.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub clear_secret: bool,
    #[serde(default)]
    pub is_server: bool,
    #[serde(default)]
    pub branch_id: Option<i64>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_kind() -> ProbeKind {
    ProbeKind::Jobs
}

fn default_active() -> bool {
    true
}

impl TargetRequest {
    fn validate(&self) -> Result<(), Response> {
        if self.name.trim().is_empty() || self.address.trim().is_empty() {
            return Err(fail(StatusCode::BAD_REQUEST, "name and address are required"));
        }
        Ok(())
    }
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> Response {
    if let Err(resp) = req.validate() {
        return resp;
    }

    let mut target = Target {
        id: 0,
        name: req.name.trim().to_string(),
        address: req.address.trim().to_string(),
        probe_kind: req.probe_kind,
        principal: req.principal,
        secret: state.cipher.encrypt(req.secret.as_deref().unwrap_or_default()),
        is_server: req.is_server,
        branch_id: req.branch_id,
        is_active: req.is_active,
    };

    match state.store.add_target(&mut target) {
        Ok(id) => {
            tracing::info!("Registered target {} ({})", target.name, id);
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "data": target })),
            )
                .into_response()
        }
        Err(e) => db_failure(e),
    }
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TargetRequest>,
) -> Response {
    if let Err(resp) = req.validate() {
        return resp;
    }

    let existing = match load_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let secret = match req.secret.as_deref() {
        _ if req.clear_secret => String::new(),
        Some(s) if !s.is_empty() => state.cipher.encrypt(s),
        _ => existing.secret.clone(),
    };

    let updated = Target {
        id,
        name: req.name.trim().to_string(),
        address: req.address.trim().to_string(),
        probe_kind: req.probe_kind,
        principal: req.principal,
        secret,
        is_server: req.is_server,
        branch_id: req.branch_id,
        is_active: req.is_active,
    };

    if let Err(e) = state.store.update_target(&updated) {
        return db_failure(e);
    }

    // Whatever was observed belongs to the old endpoint
    if updated.address != existing.address
        || updated.probe_kind != existing.probe_kind
        || updated.is_server != existing.is_server
    {
        state.aggregator.forget(id);
        state.rates.invalidate(Some(id));
    }

    Json(json!({ "success": true, "data": updated })).into_response()
}

pub async fn handle_delete_target(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.store.delete_target(id) {
        return db_failure(e);
    }

    state.aggregator.forget(id);
    state.rates.invalidate(Some(id));
    tracing::info!("Deleted target {}", id);
    Json(json!({ "success": true })).into_response()
}

// ============================================================================
// Job schedulers
// ============================================================================

pub async fn handle_target_jobs(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let target = match load_jobs_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let snapshot = state
        .aggregator
        .refresh_one(&target, &CancellationToken::new())
        .await;

    match snapshot.error {
        Some(error) => fail(StatusCode::BAD_GATEWAY, error),
        None => Json(json!({
            "success": true,
            "data": snapshot.jobs,
            "serverTime": snapshot.reference_clock,
            "status": snapshot.status,
        }))
        .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCommand {
    pub job_name: String,
}

pub async fn handle_start_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(cmd): Json<JobCommand>,
) -> Response {
    job_command(state, id, cmd, true).await
}

pub async fn handle_stop_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(cmd): Json<JobCommand>,
) -> Response {
    job_command(state, id, cmd, false).await
}

async fn job_command(state: AppState, id: i64, cmd: JobCommand, start: bool) -> Response {
    if cmd.job_name.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "jobName is required");
    }
    let target = match load_jobs_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let result = if start {
        state.jobs.start_job(&target, &cmd.job_name).await
    } else {
        state.jobs.stop_job(&target, &cmd.job_name).await
    };

    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => {
            tracing::warn!("Job command on {} failed: {}", target.name, e);
            probe_failure(e)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JobHistoryQuery {
    pub name: Option<String>,
}

pub async fn handle_job_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<JobHistoryQuery>,
) -> Response {
    let Some(name) = query.name.filter(|n| !n.trim().is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "name is required");
    };
    let target = match load_jobs_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.jobs.job_history(&target, &name).await {
        Ok(runs) => Json(json!({ "success": true, "data": runs })).into_response(),
        Err(e) => probe_failure(e),
    }
}

// ============================================================================
// Fan-out
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub target_ids: Option<Vec<i64>>,
    pub branch_id: Option<i64>,
    pub batch_id: Option<Uuid>,
}

pub async fn handle_refresh(
    State(state): State<AppState>,
    body: Option<Json<RefreshRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let filter = TargetFilter {
        branch_id: req.branch_id,
        ..Default::default()
    };
    let mut targets = match state.store.list_targets(&filter) {
        Ok(t) => t,
        Err(e) => return db_failure(e),
    };
    if let Some(ids) = &req.target_ids {
        targets.retain(|t| ids.contains(&t.id));
    }

    let batch = state.batches.begin(req.batch_id);
    let data = state.aggregator.refresh_all(&targets, &batch.token).await;
    let cancelled = batch.token.is_cancelled();

    Json(json!({
        "success": true,
        "batchId": batch.id,
        "cancelled": cancelled,
        "data": data,
    }))
    .into_response()
}

pub async fn handle_cancel_refresh(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Response {
    if state.batches.cancel(&batch_id) {
        Json(json!({ "success": true })).into_response()
    } else {
        fail(StatusCode::NOT_FOUND, "Unknown or finished batch")
    }
}

pub async fn handle_status(State(state): State<AppState>) -> Response {
    Json(json!({ "success": true, "data": state.aggregator.snapshots() })).into_response()
}

// ============================================================================
// Cached exchange rates
// ============================================================================

pub async fn handle_currency_rates(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let target = match load_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let jobs = state.jobs.clone();
    let label = target.name.clone();
    let result = state
        .rates
        .get(id, &label, || async move {
            jobs.currency_rates(&target).await
        })
        .await;

    match result {
        Ok(rates) => Json(rates).into_response(),
        Err(e) => {
            tracing::error!("Currency lookup failed for target {}: {}", id, e);
            probe_failure(e)
        }
    }
}

pub async fn handle_cache_stats(State(state): State<AppState>) -> Response {
    Json(json!({ "success": true, "data": state.rates.stats() })).into_response()
}

pub async fn handle_cache_clear_all(State(state): State<AppState>) -> Response {
    let removed = state.rates.invalidate(None);
    Json(json!({
        "success": true,
        "message": format!("Cache cleared ({} entries)", removed),
    }))
    .into_response()
}

pub async fn handle_cache_clear_one(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let removed = state.rates.invalidate(Some(id));
    let message = if removed > 0 {
        format!("Cache cleared for target {}", id)
    } else {
        format!("No cache entry for target {}", id)
    };
    Json(json!({ "success": true, "message": message })).into_response()
}

// ============================================================================
// Reachability
// ============================================================================

/// A reachability target with its last persisted check.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    #[serde(flatten)]
    pub target: Target,
    pub last_status: Option<bool>,
    pub last_response_time: Option<f64>,
    pub last_packet_loss: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ServiceView {
    fn new(target: Target, last: Option<&HistoryRecord>) -> Self {
        Self {
            target,
            last_status: last.map(|r| r.is_alive),
            last_response_time: last.and_then(|r| r.response_time),
            last_packet_loss: last.and_then(|r| r.packet_loss.clone()),
            last_checked_at: last.map(|r| r.checked_at),
        }
    }
}

pub async fn handle_list_services(
    State(state): State<AppState>,
    Query(query): Query<TargetsQuery>,
) -> Response {
    let filter = TargetFilter {
        branch_id: query.branch_id,
        kind: Some(ProbeKind::Ping),
        include_inactive: query.include_inactive,
    };

    let targets = match state.store.list_targets(&filter) {
        Ok(t) => t,
        Err(e) => return db_failure(e),
    };
    let ids: Vec<i64> = targets.iter().map(|t| t.id).collect();
    let latest = match state.store.latest_history(&ids) {
        Ok(l) => l,
        Err(e) => return db_failure(e),
    };

    let data: Vec<ServiceView> = targets
        .into_iter()
        .map(|t| {
            let last = latest.get(&t.id);
            ServiceView::new(t, last)
        })
        .collect();
    Json(json!({ "success": true, "data": data })).into_response()
}

pub async fn handle_ping(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let target = match load_target(&state, id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let result = state.aggregator.ping_target(&target).await;
    Json(json!({ "success": true, "result": result })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingBatchRequest {
    #[serde(default)]
    pub service_ids: Vec<i64>,
}

pub async fn handle_ping_batch(
    State(state): State<AppState>,
    Json(req): Json<PingBatchRequest>,
) -> Response {
    if req.service_ids.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "serviceIds must be a non-empty array");
    }

    let mut targets = Vec::with_capacity(req.service_ids.len());
    for id in &req.service_ids {
        match load_target(&state, *id) {
            Ok(t) => targets.push(t),
            Err(resp) => return resp,
        }
    }

    tracing::info!("Pinging {} services", targets.len());
    let results = state.aggregator.ping_all(&targets).await;
    Json(json!({ "success": true, "results": results })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

pub async fn handle_ping_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.store.query_history(id, limit) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_failure(e),
    }
}
