use std::convert::Infallible;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::dataset::SourceDeclaration;
use crate::domain::RunConfig;
use crate::errors::EngineError;
use crate::{artifacts, orchestrator, retention};

use super::{ApiError, AppState};

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `POST /runs` (§6): idempotent create. The declared dataset is
/// ingested (or pulled from cache) first so `data_hash` is known before
/// `run_hash` can be computed.
pub async fn submit_run(
    State(state): State<AppState>,
    Json(config): Json<RunConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let decl = SourceDeclaration {
        symbol: config.symbol.clone(),
        timeframe: config.timeframe.clone(),
        source_tz_offset_minutes: 0,
        calendar_id: "24x7".to_string(),
    };
    let dataset = state
        .engine
        .get_or_load_dataset(&config.symbol, &decl, chrono::Utc::now().timestamp_millis())
        .await?;
    let data_hash = dataset.metadata.data_hash.clone();
    let symbol = config.symbol.clone();

    let response = state.engine.submit(config, &data_hash, &symbol, now_iso()).await?;
    Ok(Json(json!({
        "run_hash": response.run_hash,
        "status": response.status,
        "reused": response.attached_existing,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
}

/// `GET /runs` (§6): newest-first, bounded listing.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = q.limit.unwrap_or(50);
    let records = state.engine.registry().list_recent(limit)?;
    let out: Vec<_> = records.iter().map(orchestrator::describe).collect();
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    include_anomalies: bool,
}

/// `GET /runs/{run_hash}` (§6).
pub async fn get_run(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    Query(q): Query<DetailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .engine
        .registry()
        .find(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    let mut body = orchestrator::describe(&record);
    if let Some(manifest_json) = &record.manifest_json {
        if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(manifest_json) {
            body["manifest_hash"] = manifest["manifest_hash"].clone();
            body["data_hash"] = manifest["data_hash"].clone();
            body["calendar_id"] = manifest["calendar_id"].clone();
        }
    }
    if q.include_anomalies {
        body["anomaly_counters_note"] = json!("per-dataset anomaly counters are not retained per-run; re-ingest to inspect");
    }
    Ok(Json(body))
}

/// `POST /runs/{run_hash}/cancel` (§6): idempotent.
pub async fn cancel_run(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .engine
        .registry()
        .find(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    if !record.status.is_terminal() {
        state.engine.cancel(&run_hash)?;
    }
    let current = state.engine.registry().find(&run_hash)?.unwrap();
    Ok(Json(json!({"run_hash": run_hash, "status": current.status})))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    after_id: Option<u64>,
}

/// `GET /runs/{run_hash}/events` (§6): snapshot mode with `ETag`.
pub async fn get_events(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let buffer = state
        .engine
        .get_event_buffer(&run_hash)
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    let buffer = buffer.lock();

    if let Some(if_none_match) = headers.get("If-None-Match").and_then(|v| v.to_str().ok()) {
        if buffer.etag_matches(if_none_match) {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let (events, etag) = buffer.snapshot(q.after_id.unwrap_or(0));
    let mut response = Json(json!({"events": events})).into_response();
    response
        .headers_mut()
        .insert("ETag", etag.parse().expect("etag is ascii"));
    Ok(response)
}

/// `GET /runs/{run_hash}/events/stream` (§6): SSE, resumable via
/// `Last-Event-ID`, ~15s heartbeat, closes on a terminal event.
pub async fn stream_events(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let buffer_handle = state
        .engine
        .get_event_buffer(&run_hash)
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;

    let last_event_id: u64 = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let (backlog, rx) = {
        let buffer = buffer_handle.lock();
        (buffer.backlog_since(last_event_id), buffer.subscribe())
    };

    let backlog_stream = stream::iter(backlog.into_iter().map(to_sse_event));

    enum LiveState {
        Open(tokio::sync::broadcast::Receiver<crate::domain::Event>),
        Done,
    }
    let live_stream = stream::unfold(LiveState::Open(rx), |state| async move {
        let mut rx = match state {
            LiveState::Open(rx) => rx,
            LiveState::Done => return None,
        };
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.event_type.is_terminal();
                    let next_state = if terminal { LiveState::Done } else { LiveState::Open(rx) };
                    return Some((to_sse_event(event), next_state));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    let combined = backlog_stream.chain(live_stream);
    Ok(Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(crate::events::HEARTBEAT_SECS))
            .text("heartbeat"),
    ))
}

fn to_sse_event(event: crate::domain::Event) -> Result<SseEvent, Infallible> {
    let data = serde_json::to_string(&event).unwrap_or_default();
    Ok(SseEvent::default().id(event.id.to_string()).data(data))
}

/// `GET /runs/{run_hash}/artifacts` (§6): manifest listing.
pub async fn get_artifacts(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .engine
        .registry()
        .find(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    let manifest_json = record
        .manifest_json
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash} has no artifacts yet")))?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest_json)
        .map_err(|e| EngineError::internal(format!("stored manifest corrupt: {e}")))?;
    Ok(Json(manifest))
}

/// `GET /runs/{run_hash}/artifact/{name}` (§6): name restricted to the
/// artifact whitelist. A `manifest_only`-tier run still answers
/// `manifest.json` itself but returns `410 Gone` with rehydration paths for
/// the bulk files retention already demoted.
pub async fn get_artifact(
    State(state): State<AppState>,
    AxumPath((run_hash, name)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !artifacts::whitelist().contains(&name.as_str()) {
        return Err(EngineError::InvalidParam(format!("artifact name not in whitelist: {name}")).into());
    }
    let record = state
        .engine
        .registry()
        .find(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    let path = state.engine.config().artifacts_root.join(&run_hash).join(&name);
    if !path.exists() {
        if record.retention_tier == crate::domain::RetentionTier::ManifestOnly && name != "manifest.json" {
            let hint: Vec<String> = retention::rehydrate_paths(&state.engine.config().artifacts_root, &run_hash)
                .into_iter()
                .map(|p| p.display().to_string())
                .collect();
            return Ok((
                StatusCode::GONE,
                Json(json!({
                    "error": {
                        "code": "NOT_FOUND",
                        "message": "artifact demoted by retention policy",
                        "rehydrate_paths": hint,
                    }
                })),
            )
                .into_response());
        }
        return Err(EngineError::NotFound(format!("artifact {name} for run {run_hash}")).into());
    }
    let bytes = std::fs::read(&path).map_err(|e| EngineError::Persist(e.to_string()))?;
    Ok(bytes.into_response())
}

/// `GET /runs/{run_hash}/hashes` (§6): attestation bundle.
pub async fn get_hashes(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let hashes = state
        .engine
        .registry()
        .hashes(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash} has no completed attestation")))?;
    Ok(Json(hashes))
}

#[derive(Debug, Deserialize)]
pub struct PinBody {
    #[serde(default = "default_actor")]
    actor: String,
}

fn default_actor() -> String {
    "api".to_string()
}

pub async fn pin_run(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    Json(body): Json<PinBody>,
) -> Result<impl IntoResponse, ApiError> {
    retention::pin(state.engine.registry(), &run_hash, &body.actor, &now_iso())?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpin_run(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    Json(body): Json<PinBody>,
) -> Result<impl IntoResponse, ApiError> {
    retention::unpin(state.engine.registry(), &run_hash, &body.actor, &now_iso())?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /runs/{run_hash}/rehydrate` (§4.11): rebuild a `manifest_only`
/// run's bulk artifacts and promote it back to `full`, or fail with
/// `PERSIST_REHYDRATE_UNAVAILABLE` if the source dataset has moved on.
pub async fn rehydrate_run(
    State(state): State<AppState>,
    AxumPath(run_hash): AxumPath<String>,
    Json(body): Json<PinBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.rehydrate(&run_hash, &body.actor, &now_iso()).await?;
    let record = state
        .engine
        .registry()
        .find(&run_hash)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;
    Ok(Json(json!({"run_hash": run_hash, "retention_tier": record.retention_tier})))
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
