//! Orchestration of one planning cycle (spec §2 data flow, §4.5 state
//! machine, §5 concurrency model): the control-plane HTTP surface (C11)
//! calls into this crate on `POST /run`, and this crate wires the
//! registry (C2/C3), cache (C7), forecast fetcher (C4), scorer (C5),
//! planner (C6), and deployment orchestrator (C8) into one pass over
//! every registered function.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Timelike, Utc};
use csched_cache::CacheError;
use csched_deploy::{DeployOutcome, Deployer};
use csched_forecast::{FetchMode, ForecastProvider};
use csched_planner::{CycleStatus, RankingOracle};
use csched_registry::{NormalizationOracle, RejectedFunction};
use csched_store::ObjectStore;
use csched_telemetry::{EventBuilder, EventKind, TelemetryLog};
use csched_types::schedule::ForecastMode;
use csched_types::{BackoffPolicy, FunctionMetadata, Schedule, StaticCatalog};
use tokio::sync::Semaphore;

/// Tunables for one planning cycle (spec §4.5, §5, §4.7).
#[derive(Clone, Copy, Debug)]
pub struct CycleConfig {
    /// Top-N candidates kept per function (spec §4.5 default 24).
    pub top_n: usize,
    /// Top-M priorities the deployment orchestrator realizes (spec §4.7 default 3).
    pub top_m: usize,
    /// Bounded concurrency cap for per-function fan-out (spec §5 default 8).
    pub concurrency: usize,
    /// Cycle-wide deadline; functions not `WRITTEN` by then are left with
    /// their prior schedule and logged `FAILED_TIMEOUT` (spec §5 default 4 min).
    pub cycle_deadline: StdDuration,
    pub backoff: BackoffPolicy,
    pub horizon_hours: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            top_n: csched_planner::DEFAULT_TOP_N,
            top_m: csched_deploy::DEFAULT_TOP_M,
            concurrency: 8,
            cycle_deadline: StdDuration::from_secs(4 * 60),
            backoff: BackoffPolicy::default(),
            horizon_hours: csched_forecast::HORIZON_HOURS,
        }
    }
}

/// Per-function outcome returned from one cycle, for the `/run` response
/// summary (spec §4.10).
#[derive(Clone, Debug)]
pub struct FunctionOutcome {
    pub function_id: String,
    pub status: CycleStatus,
    pub schedule: Option<Schedule>,
    pub deploy_outcomes: Vec<DeployOutcome>,
}

#[derive(Clone, Debug, Default)]
pub struct CycleSummary {
    pub outcomes: Vec<FunctionOutcome>,
    pub rejected: Vec<RejectedFunction>,
    pub forecast_mode: Option<ForecastMode>,
}

/// Wires every component crate together behind `Arc`s so the control
/// plane and the CLI can both build one instance and share it across
/// concurrent `/run` calls (spec §5: the bucket is the single source of
/// truth; this struct holds no authoritative state of its own).
pub struct PlanningCycle {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<StaticCatalog>,
    pub normalization_oracle: Arc<dyn NormalizationOracle>,
    pub ranking_oracle: Option<Arc<dyn RankingOracle>>,
    pub forecast_provider: Arc<dyn ForecastProvider>,
    pub forecast_mode: FetchMode,
    pub deployer: Arc<dyn Deployer>,
    pub telemetry: Option<Arc<TelemetryLog>>,
    pub config: CycleConfig,
}

impl PlanningCycle {
    /// Hour-aligned horizon start for `now` (spec §3 `Schedule.horizon_start`).
    pub fn horizon_start(now: DateTime<Utc>) -> DateTime<Utc> {
        now.with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now)
    }

    fn emit(&self, scenario: &str, builder: EventBuilder) {
        if let Some(log) = &self.telemetry {
            if let Err(e) = log.append(builder.build()) {
                tracing::warn!(scenario, error = %e, "failed to append telemetry event");
            }
        }
    }

    /// Run one planning cycle over every function in the registry document,
    /// honoring the cycle-wide deadline (spec §5). `scenario` tags every
    /// telemetry event emitted this cycle (e.g. a cycle id).
    pub async fn run(&self, scenario: &str, now: DateTime<Utc>) -> Result<CycleSummary, CycleError> {
        let registry_outcome = csched_registry::load_registry(
            self.store.as_ref(),
            self.normalization_oracle.as_ref(),
            &self.catalog,
            self.config.backoff,
        )
        .await
        .map_err(|e| CycleError::Registry(e.to_string()))?;

        for rejected in &registry_outcome.rejected {
            tracing::warn!(function_id = ?rejected.function_id, reason = %rejected.reason, "function rejected during normalization");
        }

        let horizon_start = Self::horizon_start(now);
        let run_fut = self.plan_all(scenario, &registry_outcome.accepted, horizon_start, now);

        let outcomes = match tokio::time::timeout(self.config.cycle_deadline, run_fut).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                tracing::error!(scenario, "planning cycle exceeded cycle-wide deadline");
                // Everything still in flight is reported as a timeout; completed
                // functions before the deadline are not recoverable from here
                // since they ran inside the timed-out future, so the cycle as a
                // whole is reported as timed out (spec §5 cancellation).
                registry_outcome
                    .accepted
                    .iter()
                    .map(|m| FunctionOutcome {
                        function_id: m.function_id.clone(),
                        status: CycleStatus::FailedTimeout,
                        schedule: None,
                        deploy_outcomes: Vec::new(),
                    })
                    .collect()
            }
        };

        Ok(CycleSummary {
            outcomes,
            rejected: registry_outcome.rejected,
            forecast_mode: None,
        })
    }

    async fn plan_all(
        &self,
        scenario: &str,
        functions: &[FunctionMetadata],
        horizon_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<FunctionOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        // First pass: cache lookups decide which functions actually need a
        // forecast this cycle (spec §4.6, §4.3 "zones referenced by all
        // functions needing (re)planning").
        let mut cache_keys = HashMap::with_capacity(functions.len());
        let mut misses = Vec::new();
        for meta in functions {
            let key = match csched_cache::compute_key(meta, horizon_start) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(function_id = %meta.function_id, error = %e, "failed to compute cache key");
                    continue;
                }
            };
            match csched_cache::lookup(self.store.as_ref(), &key, now).await {
                Ok(Some(_)) => {
                    cache_keys.insert(meta.function_id.clone(), (key, true));
                }
                Ok(None) => {
                    cache_keys.insert(meta.function_id.clone(), (key.clone(), false));
                    misses.push(meta.clone());
                }
                Err(_) => {
                    cache_keys.insert(meta.function_id.clone(), (key.clone(), false));
                    misses.push(meta.clone());
                }
            }
        }

        let zones: HashSet<String> = misses
            .iter()
            .flat_map(|m| m.allowed_regions.iter())
            .filter_map(|r| self.catalog.zone_of(r).cloned())
            .collect();
        let zones: Vec<String> = zones.into_iter().collect();

        let forecast_doc = if zones.is_empty() {
            None
        } else {
            Some(
                csched_forecast::fetch_cycle(
                    Arc::clone(&self.forecast_provider),
                    &zones,
                    self.forecast_mode,
                    self.config.concurrency,
                    self.config.backoff,
                    now,
                )
                .await,
            )
        };
        if let Some(doc) = &forecast_doc {
            if let Err(e) = csched_forecast::store_merged(self.store.as_ref(), doc).await {
                tracing::warn!(scenario, error = %e, "failed to persist merged forecast document");
            }
        }

        let mut handles = Vec::with_capacity(functions.len());
        for meta in functions.to_vec() {
            let (key, is_hit) = cache_keys
                .get(&meta.function_id)
                .cloned()
                .unwrap_or_else(|| (csched_cache::compute_key(&meta, horizon_start).unwrap(), false));

            if is_hit {
                self.emit(
                    scenario,
                    EventBuilder::new(scenario, EventKind::CachedHit).function_id(&meta.function_id),
                );
                handles.push(tokio::spawn(async move {
                    FunctionOutcome {
                        function_id: meta.function_id,
                        status: CycleStatus::CachedHit,
                        schedule: None,
                        deploy_outcomes: Vec::new(),
                    }
                }));
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let forecast_doc = forecast_doc.clone();
            let this_catalog = Arc::clone(&self.catalog);
            let ranking_oracle = self.ranking_oracle.clone();
            let deployer = Arc::clone(&self.deployer);
            let config = self.config;
            let telemetry = self.telemetry.clone();
            let scenario = scenario.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                plan_one(
                    &scenario,
                    meta,
                    key,
                    horizon_start,
                    now,
                    forecast_doc,
                    &this_catalog,
                    ranking_oracle.as_deref(),
                    deployer.as_ref(),
                    config,
                    telemetry.as_deref(),
                )
                .await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "planning task panicked"),
            }
        }
        outcomes
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("registry load failed: {0}")]
    Registry(String),
}

#[allow(clippy::too_many_arguments)]
async fn plan_one(
    scenario: &str,
    meta: FunctionMetadata,
    key: csched_types::PlanCacheKey,
    horizon_start: DateTime<Utc>,
    now: DateTime<Utc>,
    forecast_doc: Option<csched_forecast::MergedForecastDocument>,
    catalog: &StaticCatalog,
    ranking_oracle: Option<&dyn RankingOracle>,
    deployer: &dyn Deployer,
    config: CycleConfig,
    telemetry: Option<&TelemetryLog>,
) -> FunctionOutcome {
    let emit = |kind: EventKind, detail: Option<String>| {
        if let Some(log) = telemetry {
            let mut builder = EventBuilder::new(scenario, kind).function_id(&meta.function_id);
            if let Some(d) = detail {
                builder = builder.detail(d);
            }
            if let Err(e) = log.append(builder.build()) {
                tracing::warn!(error = %e, "failed to append telemetry event");
            }
        }
    };

    let Some(doc) = forecast_doc else {
        emit(EventKind::Failed, Some("no forecast available for any allowed region".into()));
        return FunctionOutcome {
            function_id: meta.function_id,
            status: CycleStatus::Failed("no forecast available".into()),
            schedule: None,
            deploy_outcomes: Vec::new(),
        };
    };

    let forecasts_by_zone: HashMap<String, csched_types::CarbonForecast> = meta
        .allowed_regions
        .iter()
        .filter_map(|r| catalog.zone_of(r))
        .filter_map(|zone| doc.zones.get(zone).map(|f| (zone.clone(), f.clone())))
        .collect();

    let candidates = csched_scorer::score_candidates(&meta, catalog, &forecasts_by_zone, horizon_start, None);

    if candidates.is_empty() {
        emit(EventKind::Failed, Some("no candidates scored (no forecast for any allowed region)".into()));
        return FunctionOutcome {
            function_id: meta.function_id,
            status: CycleStatus::Failed("no candidates".into()),
            schedule: None,
            deploy_outcomes: Vec::new(),
        };
    }
    emit(EventKind::Scored, None);

    let ranked = csched_planner::rank_candidates(candidates, &meta, ranking_oracle, config.top_n).await;
    emit(EventKind::Ranked, None);

    let mode = match doc.mode {
        FetchMode::Forecast => ForecastMode::Forecast,
        FetchMode::Historical => ForecastMode::Historical,
    };

    let metadata_hash = key.metadata_hash_hex.clone();
    let mut schedule = csched_planner::build_schedule(
        &meta.function_id,
        horizon_start,
        now,
        mode,
        &ranked,
        metadata_hash,
        HashMap::new(),
    );

    if let Err(e) = schedule.validate() {
        emit(EventKind::Failed, Some(format!("schedule failed invariant validation: {e}")));
        return FunctionOutcome {
            function_id: meta.function_id,
            status: CycleStatus::Failed(e.to_string()),
            schedule: None,
            deploy_outcomes: Vec::new(),
        };
    }

    let deploy_outcomes = csched_deploy::reconcile(&mut schedule, &meta, deployer, config.top_m, config.backoff).await;
    for outcome in &deploy_outcomes {
        if let Err(e) = &outcome.result {
            emit(EventKind::DeployFailed, Some(format!("{}: {e}", outcome.region)));
        }
    }

    FunctionOutcome {
        function_id: meta.function_id,
        status: CycleStatus::Written,
        schedule: Some(schedule),
        deploy_outcomes,
    }
}

/// Write a cycle's successful (non-cached, non-failed) schedules to the
/// store. Split from `plan_one` so the caller decides whether a `CACHED_HIT`
/// function's (already-stored) schedule should be re-read for the summary.
pub async fn persist_written_schedules(
    store: &dyn ObjectStore,
    outcomes: &[FunctionOutcome],
) -> Result<(), CacheError> {
    for outcome in outcomes {
        if let (CycleStatus::Written, Some(schedule)) = (&outcome.status, &outcome.schedule) {
            csched_cache::store_schedule(store, schedule).await?;
        }
    }
    Ok(())
}
