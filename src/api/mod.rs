//! HTTP adapter over the coordinator.
//!
//! Payloads and proofs travel hex-encoded inside JSON bodies, except for job
//! submission which takes the raw payload as the request body. Dispatches
//! reach workers through a per-worker [`Mailbox`] that the worker drains by
//! long-polling `GET /api/workers/:id/jobs`. A poll counts as a heartbeat
//! when it starts and when it returns, and never waits longer than the
//! coordinator's sweep interval.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collector::{Collected, Outcome};
use crate::coordinator::{Coordinator, JobResult};
use crate::error::{CoordinatorError, ErrorKind};
use crate::registry::{mailbox, Dispatch, Mailbox, WorkerId};
use crate::stats::StatsQuery;
use crate::store::{JobId, SubmitOptions};

const DEFAULT_AWAIT_MS: u64 = 30_000;
const MAX_WAIT_MS: u64 = 300_000;

type Mailboxes = HashMap<WorkerId, Arc<Mutex<Mailbox>>>;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl ApiState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drop mailboxes of workers the coordinator no longer knows, e.g.
    /// after an eviction the worker never polled again to notice.
    pub async fn prune_mailboxes(&self) -> usize {
        // Held across the lookup so a concurrent re-registration keeps its
        // fresh mailbox.
        let mut mailboxes = self.mailboxes.lock().await;
        let registered: HashSet<WorkerId> = self
            .coordinator
            .list_workers()
            .await
            .into_iter()
            .map(|w| w.worker_id)
            .collect();
        let before = mailboxes.len();
        mailboxes.retain(|id, _| registered.contains(id));
        before - mailboxes.len()
    }

    /// Prune mailboxes once per sweep interval until `shutdown` fires.
    pub async fn run_mailbox_pruner(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.coordinator.config().sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let pruned = self.prune_mailboxes().await;
                    if pruned > 0 {
                        tracing::debug!(pruned, "Dropped mailboxes of departed workers");
                    }
                }
            }
        }
    }
}

/// Error response carrying `{"error", "kind"}`.
#[derive(Debug)]
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        if let CoordinatorError::PayloadTooLarge { .. } = self.0 {
            return StatusCode::PAYLOAD_TOO_LARGE;
        }
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::WorkerFault => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind().to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    job_id: Option<String>,
    max_retries: Option<u32>,
    /// Assignment timeout in milliseconds.
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    wait: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    worker_id: String,
    address: Option<String>,
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum OutcomeBody {
    Proven {
        #[serde(deserialize_with = "hex::serde::deserialize")]
        proof: Vec<u8>,
    },
    Failed {
        error: String,
    },
}

impl From<OutcomeBody> for Outcome {
    fn from(body: OutcomeBody) -> Self {
        match body {
            OutcomeBody::Proven { proof } => Outcome::Proven(Bytes::from(proof)),
            OutcomeBody::Failed { error } => Outcome::Failed(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    job_id: String,
    outcome: OutcomeBody,
}

#[derive(Debug, Serialize)]
struct ResultResponse {
    job_id: JobId,
    result: Collected,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    /// Comma-separated worker ids.
    workers: Option<String>,
    from_t: Option<u64>,
    to_t: Option<u64>,
}

impl From<StatsParams> for StatsQuery {
    fn from(params: StatsParams) -> Self {
        let workers = params.workers.map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(WorkerId::from)
                .collect()
        });
        StatsQuery {
            workers,
            from_t: params.from_t,
            to_t: params.to_t,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // One byte over the limit still reaches the store so oversize payloads
    // get the regular error body.
    let body_limit = state
        .coordinator
        .config()
        .max_payload_bytes
        .saturating_add(1);

    Router::new()
        .route("/api/jobs", post(submit_job_handler).get(list_jobs_handler))
        .route(
            "/api/jobs/:id",
            get(job_status_handler).delete(acknowledge_handler),
        )
        .route("/api/jobs/:id/result", get(await_result_handler))
        .route(
            "/api/workers",
            post(register_worker_handler).get(list_workers_handler),
        )
        .route("/api/workers/:id", delete(disconnect_handler))
        .route("/api/workers/:id/heartbeat", post(heartbeat_handler))
        .route("/api/workers/:id/jobs", get(poll_jobs_handler))
        .route("/api/workers/:id/results", post(submit_result_handler))
        .route("/api/worker-stats", get(worker_stats_handler))
        .route("/api/status", get(status_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP API");

    let pruner_shutdown = shutdown.child_token();
    let pruner = {
        let state = state.clone();
        let shutdown = pruner_shutdown.clone();
        tokio::spawn(async move { state.run_mailbox_pruner(shutdown).await })
    };

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    pruner_shutdown.cancel();
    if let Err(e) = pruner.await {
        tracing::error!(error = %e, "Mailbox pruner panicked");
    }
    served
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Query(query): Query<SubmitQuery>,
    payload: Bytes,
) -> ApiResult<impl IntoResponse> {
    let options = SubmitOptions {
        job_id: query.job_id.map(JobId::from),
        max_retries: query.max_retries,
        assignment_timeout_ms: query.timeout,
    };
    let job_id = state.coordinator.submit(payload, options).await?;
    Ok((StatusCode::CREATED, Json(json!({ "job_id": job_id }))))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.coordinator.list_jobs().await)
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let view = state.coordinator.status(&JobId::from(id)).await?;
    Ok(Json(view))
}

async fn await_result_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<impl IntoResponse> {
    let wait = query.timeout.unwrap_or(DEFAULT_AWAIT_MS).min(MAX_WAIT_MS);
    let completion = state
        .coordinator
        .await_result(&JobId::from(id), Duration::from_millis(wait))
        .await?;
    Ok(Json(JobResult::from(completion)))
}

async fn acknowledge_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.coordinator.acknowledge(&JobId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_worker_handler(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let worker_id = WorkerId::from(request.worker_id);
    let (link, mailbox) = mailbox();

    let handle = state
        .coordinator
        .register_worker(
            worker_id,
            request.address,
            request.capacity,
            Arc::new(link),
        )
        .await?;

    state
        .mailboxes
        .lock()
        .await
        .insert(handle.id.clone(), Arc::new(Mutex::new(mailbox)));

    Ok((
        StatusCode::CREATED,
        Json(json!({ "accepted": true, "worker_id": handle.id })),
    ))
}

async fn list_workers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.coordinator.list_workers().await)
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.coordinator.heartbeat(&WorkerId::from(id)).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Long-poll for dispatches. A poll also counts as a heartbeat.
async fn poll_jobs_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> ApiResult<impl IntoResponse> {
    let worker_id = WorkerId::from(id);
    if let Err(e) = state.coordinator.heartbeat(&worker_id).await {
        // Evicted workers leave their mailbox behind.
        state.mailboxes.lock().await.remove(&worker_id);
        return Err(e.into());
    }

    let mailbox = state
        .mailboxes
        .lock()
        .await
        .get(&worker_id)
        .cloned()
        .ok_or_else(|| CoordinatorError::UnknownWorker(worker_id.clone()))?;

    // Capped so a worker parked here is never swept as silent.
    let max_wait = state.coordinator.config().sweep_interval();
    let wait = query
        .wait
        .map_or(max_wait, |ms| Duration::from_millis(ms).min(max_wait));
    let jobs: Vec<Dispatch> = mailbox.lock().await.recv_batch(wait).await;

    if let Err(e) = state.coordinator.heartbeat(&worker_id).await {
        tracing::debug!(worker_id = %worker_id, error = %e, "Worker left during poll");
    }
    Ok(Json(json!({ "jobs": jobs })))
}

async fn submit_result_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ResultRequest>,
) -> ApiResult<impl IntoResponse> {
    let job_id = JobId::from(request.job_id);
    let result = state
        .coordinator
        .submit_result(&WorkerId::from(id), &job_id, request.outcome.into())
        .await?;
    Ok(Json(ResultResponse { job_id, result }))
}

async fn disconnect_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let worker_id = WorkerId::from(id);
    let recycled = state.coordinator.disconnect_worker(&worker_id).await?;
    state.mailboxes.lock().await.remove(&worker_id);
    Ok(Json(json!({ "reclaimed": recycled.len() })))
}

async fn worker_stats_handler(
    State(state): State<ApiState>,
    Query(params): Query<StatsParams>,
) -> impl IntoResponse {
    let query = StatsQuery::from(params);
    Json(state.coordinator.worker_stats(&query).await)
}

async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.coordinator.summary().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        let cases = [
            (
                CoordinatorError::PayloadTooLarge { size: 2, limit: 1 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                CoordinatorError::InvalidPayload("empty".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CoordinatorError::JobNotFound(JobId::from("a")),
                StatusCode::NOT_FOUND,
            ),
            (
                CoordinatorError::DuplicateJob(JobId::from("a")),
                StatusCode::CONFLICT,
            ),
            (
                CoordinatorError::CoordinatorBusy { depth: 1, limit: 1 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                CoordinatorError::Timeout(JobId::from("a")),
                StatusCode::REQUEST_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn stats_params_split_worker_list() {
        let query = StatsQuery::from(StatsParams {
            workers: Some("w1, w2,,".to_string()),
            from_t: Some(3),
            to_t: None,
        });
        assert_eq!(
            query.workers,
            Some(vec![WorkerId::from("w1"), WorkerId::from("w2")])
        );
        assert_eq!(query.from_t, Some(3));
    }
}
