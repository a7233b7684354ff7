//! Control-plane HTTP surface (spec C11 / §4.10): drives the planner on a
//! cadence, exposes health, and accepts ad-hoc one-shot submissions. Thin
//! axum handlers over the same component crates `csched-core` wires
//! together for a full planning cycle; `csched-controlplane`'s binary only
//! does env loading and server bring-up, the logic below is what's tested.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use csched_catalog::STATIC_CONFIG_KEY;
use csched_core::{CycleSummary, PlanningCycle};
use csched_deploy::{DeployError, DeploySkippedOrApplied, Deployer};
use csched_dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use csched_planner::CycleStatus;
use csched_registry::RejectedFunction;
use csched_store::ObjectStore;
use csched_types::{FunctionMetadata, FunctionSource, StaticCatalog, Weights};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

/// How many ranked recommendations the `/run` summary echoes back per
/// function (spec §4.10 "top-5 recommendations").
const RUN_SUMMARY_TOP_N: usize = 5;

/// Ad-hoc submissions don't carry these fields (spec §6's `/submit` body is
/// `{code, deadline_utc, memory_mb, requirements[]}` only); we fill them
/// with conservative defaults and record the choice in DESIGN.md.
const ADHOC_RUNTIME_MS: u64 = 1000;
const ADHOC_INPUT_BYTES: u64 = 1024;
const ADHOC_OUTPUT_BYTES: u64 = 1024;
const ADHOC_INVOCATIONS_PER_DAY: u64 = 1;
const ADHOC_VCPUS: f64 = 1.0;

#[derive(Clone)]
pub struct LastCycleInfo {
    pub scenario: String,
    pub at_utc: DateTime<Utc>,
    pub written: usize,
    pub cached_hit: usize,
    pub failed: usize,
}

/// Everything the control-plane handlers need, wired once at startup and
/// shared across concurrent requests (spec §5: the bucket is the single
/// source of truth, this struct holds only references plus the small
/// `last_cycle` summary cache).
#[derive(Clone)]
pub struct ControlPlaneState {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<StaticCatalog>,
    pub cycle: Arc<PlanningCycle>,
    pub dispatcher: Arc<Dispatcher>,
    pub deployer: Arc<dyn Deployer>,
    /// Source region used to price egress for ad-hoc submissions (spec §3
    /// `FunctionMetadata.source_region`); typically the region this
    /// control plane itself runs in.
    pub planning_region: String,
    pub last_cycle: Arc<Mutex<Option<LastCycleInfo>>>,
}

pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/submit", post(submit_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    secrets_present: bool,
    bucket_reachable: bool,
    last_cycle: Option<LastCycleSummaryJson>,
}

#[derive(Serialize)]
struct LastCycleSummaryJson {
    scenario: String,
    at_utc: DateTime<Utc>,
    written: usize,
    cached_hit: usize,
    failed: usize,
}

/// `GET /health` (spec §4.10, §6): reports secret presence, bucket
/// reachability, and the last planner cycle's outcome; 503 if misconfigured.
/// Required env vars are already validated fatally at process startup
/// (spec §7 "configuration errors ... fatal at startup"), so by the time
/// this handler runs `secrets_present` is always true — it's surfaced
/// anyway since that's the contract's literal wording.
async fn health_handler(State(state): State<ControlPlaneState>) -> Response {
    let bucket_reachable = match state.store.get(STATIC_CONFIG_KEY).await {
        Ok(_) => true,
        Err(csched_store::StoreError::NotFound(_)) => true,
        Err(_) => false,
    };

    let last_cycle = state
        .last_cycle
        .lock()
        .await
        .as_ref()
        .map(|c| LastCycleSummaryJson {
            scenario: c.scenario.clone(),
            at_utc: c.at_utc,
            written: c.written,
            cached_hit: c.cached_hit,
            failed: c.failed,
        });

    let body = HealthResponse {
        secrets_present: true,
        bucket_reachable,
        last_cycle,
    };

    let status = if bucket_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

#[derive(Serialize)]
struct RecommendationSummary {
    priority: u32,
    region: String,
    hour_start_utc: DateTime<Utc>,
    carbon_intensity_g_per_kwh: f64,
    transfer_cost_usd: f64,
}

#[derive(Serialize)]
struct DeployResultSummary {
    region: String,
    outcome: String,
}

#[derive(Serialize)]
struct FunctionRunSummary {
    function_id: String,
    status: String,
    failure_reason: Option<String>,
    top_recommendations: Vec<RecommendationSummary>,
    deployment_results: Vec<DeployResultSummary>,
}

#[derive(Serialize)]
struct RejectedSummary {
    function_id: Option<String>,
    reason: String,
}

#[derive(Serialize)]
struct RunResponse {
    scenario: String,
    functions: Vec<FunctionRunSummary>,
    rejected: Vec<RejectedSummary>,
}

fn status_label(status: &CycleStatus) -> (&'static str, Option<String>) {
    match status {
        CycleStatus::CachedHit => ("CACHED_HIT", None),
        CycleStatus::Scored => ("SCORED", None),
        CycleStatus::Ranked => ("RANKED", None),
        CycleStatus::Written => ("WRITTEN", None),
        CycleStatus::Failed(reason) => ("FAILED", Some(reason.clone())),
        CycleStatus::FailedTimeout => ("FAILED_TIMEOUT", None),
    }
}

fn deploy_outcome_label(result: &Result<DeploySkippedOrApplied, DeployError>) -> String {
    match result {
        Ok(DeploySkippedOrApplied::AlreadyCurrent) => "already_current".to_string(),
        Ok(DeploySkippedOrApplied::Deployed(_)) => "deployed".to_string(),
        Err(e) => format!("failed: {e}"),
    }
}

fn summarize(summary: &CycleSummary) -> Vec<FunctionRunSummary> {
    summary
        .outcomes
        .iter()
        .map(|outcome| {
            let (label, reason) = status_label(&outcome.status);
            let top_recommendations = outcome
                .schedule
                .as_ref()
                .map(|s| {
                    s.ranked()
                        .into_iter()
                        .take(RUN_SUMMARY_TOP_N)
                        .map(|r| RecommendationSummary {
                            priority: r.priority,
                            region: r.region.clone(),
                            hour_start_utc: r.hour_start_utc,
                            carbon_intensity_g_per_kwh: r.carbon_intensity_g_per_kwh,
                            transfer_cost_usd: r.transfer_cost_usd,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let deployment_results = outcome
                .deploy_outcomes
                .iter()
                .map(|d| DeployResultSummary {
                    region: d.region.clone(),
                    outcome: deploy_outcome_label(&d.result),
                })
                .collect();
            FunctionRunSummary {
                function_id: outcome.function_id.clone(),
                status: label.to_string(),
                failure_reason: reason,
                top_recommendations,
                deployment_results,
            }
        })
        .collect()
}

/// `POST /run` (spec §4.10, §6): triggers a planning cycle for every
/// registered function. Body is ignored. 5xx only on a fatal planner error
/// (a missing/malformed registry document); partial per-function failures
/// are reported in the 200 body so callers can see them explicitly (spec §7
/// "`/run` returns a per-function status map").
async fn run_handler(State(state): State<ControlPlaneState>) -> Response {
    let scenario = format!("run-{}", Utc::now().to_rfc3339());

    let summary = match state.cycle.run(&scenario, Utc::now()).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(scenario, error = %e, "planning cycle failed fatally");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    if let Err(e) = csched_core::persist_written_schedules(state.store.as_ref(), &summary.outcomes).await {
        tracing::error!(scenario, error = %e, "failed to persist written schedules");
    }

    let written = summary
        .outcomes
        .iter()
        .filter(|o| o.status == CycleStatus::Written)
        .count();
    let cached_hit = summary
        .outcomes
        .iter()
        .filter(|o| o.status == CycleStatus::CachedHit)
        .count();
    let failed = summary.outcomes.len() - written - cached_hit;

    *state.last_cycle.lock().await = Some(LastCycleInfo {
        scenario: scenario.clone(),
        at_utc: Utc::now(),
        written,
        cached_hit,
        failed,
    });

    let body = RunResponse {
        scenario,
        functions: summarize(&summary),
        rejected: summary
            .rejected
            .iter()
            .map(|r: &RejectedFunction| RejectedSummary {
                function_id: r.function_id.clone(),
                reason: r.reason.clone(),
            })
            .collect(),
    };

    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Deserialize)]
struct SubmitRequest {
    code: String,
    deadline_utc: DateTime<Utc>,
    memory_mb: u64,
    #[serde(default)]
    requirements: Vec<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    function_id: String,
    scheduled_region: String,
    scheduled_hour_start_utc: DateTime<Utc>,
    deployed_url: Option<String>,
    dispatch: SubmitDispatchOutcome,
}

#[derive(Serialize)]
#[serde(tag = "kind")]
enum SubmitDispatchOutcome {
    Forwarded { status: u16 },
    Deferred { task_id: uuid::Uuid, scheduled_for_utc: DateTime<Utc> },
}

#[derive(Debug, thiserror::Error)]
enum SubmitError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        match self {
            SubmitError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            SubmitError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
            SubmitError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

/// `POST /submit` (spec §4.10, §6): accepts an ad-hoc function descriptor
/// plus a deadline, runs a single-function planning+deployment+dispatch
/// cycle, and returns the scheduled slot. 400 on schema violation.
async fn submit_handler(
    State(state): State<ControlPlaneState>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    match submit(&state, body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn submit(state: &ControlPlaneState, body: SubmitRequest) -> Result<SubmitResponse, SubmitError> {
    let now = Utc::now();

    if body.code.trim().is_empty() {
        return Err(SubmitError::BadRequest("code must not be empty".into()));
    }
    if body.memory_mb == 0 {
        return Err(SubmitError::BadRequest("memory_mb must be positive".into()));
    }
    if body.deadline_utc <= now {
        return Err(SubmitError::BadRequest("deadline_utc must be in the future".into()));
    }

    let deadline_hours = (body.deadline_utc - now).num_hours().max(1) as u32;

    let hint = body
        .code
        .lines()
        .next()
        .unwrap_or("fn")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(24)
        .collect::<String>();
    let hint = if hint.is_empty() { "fn".to_string() } else { hint };

    let function_id = csched_types::retry_with_backoff(
        state.cycle.config.backoff,
        |e: &DeployError| e.is_retryable(),
        || state.deployer.generate_name(&hint),
    )
    .await
    .map_err(|e| SubmitError::Upstream(format!("deployer generate_name failed: {e}")))?;

    let allowed_regions: Vec<String> = state.catalog.regions().cloned().collect();
    if allowed_regions.is_empty() {
        return Err(SubmitError::Internal("catalog has no regions configured".into()));
    }

    let meta = FunctionMetadata {
        function_id: function_id.clone(),
        runtime_ms: ADHOC_RUNTIME_MS,
        memory_mib: body.memory_mb,
        vcpus: ADHOC_VCPUS,
        gpu_required: false,
        gpu_type: None,
        input_bytes: ADHOC_INPUT_BYTES,
        output_bytes: ADHOC_OUTPUT_BYTES,
        source_region: state.planning_region.clone(),
        invocations_per_day: ADHOC_INVOCATIONS_PER_DAY,
        allowed_regions,
        weights: Weights::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0).expect("thirds sum to one"),
        deadline_hours,
        source: Some(FunctionSource {
            code: body.code,
            requirements: body.requirements,
        }),
    };
    meta.validate(&state.catalog)
        .map_err(|e| SubmitError::BadRequest(format!("invalid descriptor: {e}")))?;

    register_in_registry(state.store.as_ref(), &meta)
        .await
        .map_err(|e| SubmitError::Internal(format!("failed to persist registry entry: {e}")))?;

    let horizon_start = PlanningCycle::horizon_start(now);

    let zones: Vec<String> = {
        let mut zones: Vec<String> = meta
            .allowed_regions
            .iter()
            .filter_map(|r| state.catalog.zone_of(r).cloned())
            .collect();
        zones.sort();
        zones.dedup();
        zones
    };

    let forecast_doc = csched_forecast::fetch_cycle(
        Arc::clone(&state.cycle.forecast_provider),
        &zones,
        state.cycle.forecast_mode,
        state.cycle.config.concurrency,
        state.cycle.config.backoff,
        now,
    )
    .await;

    let forecasts_by_zone: HashMap<String, csched_types::CarbonForecast> = meta
        .allowed_regions
        .iter()
        .filter_map(|r| state.catalog.zone_of(r))
        .filter_map(|zone| forecast_doc.zones.get(zone).map(|f| (zone.clone(), f.clone())))
        .collect();

    let candidates =
        csched_scorer::score_candidates(&meta, &state.catalog, &forecasts_by_zone, horizon_start, None);
    if candidates.is_empty() {
        return Err(SubmitError::Upstream(
            "no forecast available for any allowed region".into(),
        ));
    }

    let ranked = csched_planner::rank_candidates(candidates, &meta, None, state.cycle.config.top_n).await;

    let mode = match forecast_doc.mode {
        csched_forecast::FetchMode::Forecast => csched_types::schedule::ForecastMode::Forecast,
        csched_forecast::FetchMode::Historical => csched_types::schedule::ForecastMode::Historical,
    };

    let metadata_hash = csched_cache::compute_key(&meta, horizon_start)
        .map_err(|e| SubmitError::Internal(format!("failed to compute cache key: {e}")))?
        .metadata_hash_hex;

    let mut schedule = csched_planner::build_schedule(
        &meta.function_id,
        horizon_start,
        now,
        mode,
        &ranked,
        metadata_hash,
        HashMap::new(),
    );
    schedule
        .validate()
        .map_err(|e| SubmitError::Internal(format!("schedule failed invariant validation: {e}")))?;

    let deploy_outcomes = csched_deploy::reconcile(
        &mut schedule,
        &meta,
        state.deployer.as_ref(),
        state.cycle.config.top_m,
        state.cycle.config.backoff,
    )
    .await;
    for outcome in &deploy_outcomes {
        if let Err(e) = &outcome.result {
            tracing::warn!(function_id = %meta.function_id, region = %outcome.region, error = %e, "ad-hoc deployment failed");
        }
    }

    let top = schedule
        .ranked()
        .first()
        .map(|r| (r.region.clone(), r.hour_start_utc))
        .ok_or_else(|| SubmitError::Internal("schedule has no recommendations".into()))?;
    let deployed_url = schedule.deployment.get(&top.0).map(|d| d.url.clone());

    csched_cache::store_schedule(state.store.as_ref(), &schedule)
        .await
        .map_err(|e| SubmitError::Internal(format!("failed to persist schedule: {e}")))?;

    let dispatch_outcome = state
        .dispatcher
        .dispatch(&meta.function_id, serde_json::Value::Null, None, now)
        .await
        .map_err(|e| match e {
            DispatchError::NoViableSlot => SubmitError::Upstream("no viable slot within deadline".into()),
            DispatchError::TargetExhausted => SubmitError::Upstream("target region(s) failed after retries".into()),
            other => SubmitError::Internal(other.to_string()),
        })?;

    let dispatch = match dispatch_outcome {
        DispatchOutcome::Forwarded { status, .. } => SubmitDispatchOutcome::Forwarded { status },
        DispatchOutcome::Deferred { task_id, scheduled_for_utc } => {
            SubmitDispatchOutcome::Deferred { task_id, scheduled_for_utc }
        }
    };

    Ok(SubmitResponse {
        function_id: meta.function_id,
        scheduled_region: top.0,
        scheduled_hour_start_utc: top.1,
        deployed_url,
        dispatch,
    })
}

/// Append an ad-hoc descriptor to the registry document so subsequent
/// `/run` cycles manage it like any other registered function.
async fn register_in_registry(store: &dyn ObjectStore, meta: &FunctionMetadata) -> Result<(), csched_store::StoreError> {
    let mut descriptors: Vec<serde_json::Value> = match store.get(csched_registry::REGISTRY_KEY).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(csched_store::StoreError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    descriptors.push(serde_json::json!({
        "function_id": meta.function_id,
        "runtime_ms": meta.runtime_ms,
        "memory_mib": meta.memory_mib,
        "vcpus": meta.vcpus,
        "gpu_required": meta.gpu_required,
        "input_bytes": meta.input_bytes,
        "output_bytes": meta.output_bytes,
        "source_region": meta.source_region,
        "invocations_per_day": meta.invocations_per_day,
        "allowed_regions": meta.allowed_regions,
        "weights": {
            "carbon": meta.weights.carbon,
            "cost": meta.weights.cost,
            "latency": meta.weights.latency,
        },
        "deadline_hours": meta.deadline_hours,
        "source": meta.source,
    }));

    let bytes = serde_json::to_vec_pretty(&descriptors).map_err(|e| csched_store::StoreError::Io(e.to_string()))?;
    store.put(csched_registry::REGISTRY_KEY, bytes).await
}
