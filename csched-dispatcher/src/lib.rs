//! Request dispatch (spec C10 / §4.9): for each inbound call, loads the
//! function's active schedule, picks the effective slot (now or nearest
//! future), and either forwards the request immediately or hands it to the
//! delayed-task queue.

use std::collections::HashMap;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use csched_queue::{enqueue_with_retry, QueueAdapter};
use csched_store::{ObjectStore, StoreError};
use csched_telemetry::{EventBuilder, EventKind, TelemetryLog};
use csched_types::schedule::Recommendation;
use csched_types::{BackoffPolicy, DelayedTask, Schedule};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long a fetched schedule is trusted before the next request re-reads
/// the bucket (spec §4.9 step 1).
pub const SCHEDULE_CACHE_TTL: StdDuration = StdDuration::from_secs(60);

/// Idempotency window for repeated requests sharing an `X-Request-Id`
/// (spec §8: "two `/dispatch` calls with the same request id within 24 h
/// produce the same outcome").
pub const IDEMPOTENCY_TTL: StdDuration = StdDuration::from_secs(24 * 3600);

const DEFAULT_DEADLINE_HOURS: u32 = 24;
const NOW_WINDOW: Duration = Duration::hours(1);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no schedule found for function {0}")]
    UnknownFunction(String),
    #[error("no viable slot within deadline")]
    NoViableSlot,
    #[error("target region(s) failed after retries")]
    TargetExhausted,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed schedule document: {0}")]
    Malformed(String),
    #[error("upstream forward failed: {0}")]
    Upstream(String),
}

#[derive(Clone, Debug)]
pub enum DispatchOutcome {
    Forwarded {
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    Deferred {
        task_id: Uuid,
        scheduled_for_utc: DateTime<Utc>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotKind {
    Now,
    Future,
}

#[derive(Clone, Debug)]
struct Candidate {
    kind: SlotKind,
    recommendation: Recommendation,
}

/// Orders recommendations the way spec §4.9 step 2 picks the "effective"
/// slot, then appends the fallback chain step 2's "tries the next-ranked
/// recommendation" failure semantics falls back to.
///
/// Only the top-ranked recommendation is ever eligible for the "now"
/// window (hour-start <= now, less than an hour in the past). Spec §8
/// scenario 3 submits a function whose top recommendation (R2, CI=50) is
/// half an hour in the future while a worse, lower-ranked recommendation
/// (R1, CI=200) happens to satisfy the "now" window at call time, and
/// expects the dispatcher to defer to R2 rather than immediately forward
/// to R1. So lower-ranked recommendations are only ever considered as
/// future slots, never tested against the "now" window.
fn candidate_order(schedule: &Schedule, now: DateTime<Utc>, deadline_hours: u32) -> Vec<Candidate> {
    let ranked: Vec<Recommendation> = schedule.ranked().into_iter().cloned().collect();
    let mut out = Vec::new();

    if let Some(top) = ranked.first() {
        if top.hour_start_utc <= now && now - top.hour_start_utc < NOW_WINDOW {
            out.push(Candidate {
                kind: SlotKind::Now,
                recommendation: top.clone(),
            });
        }
    }

    let deadline = now + Duration::hours(deadline_hours.max(1) as i64);
    let mut future: Vec<Recommendation> = ranked
        .into_iter()
        .filter(|r| r.hour_start_utc > now && r.hour_start_utc <= deadline)
        .collect();
    future.sort_by_key(|r| (r.hour_start_utc, r.priority));
    out.extend(future.into_iter().map(|r| Candidate {
        kind: SlotKind::Future,
        recommendation: r,
    }));

    out
}

struct CachedSchedule {
    schedule: Schedule,
    fetched_at: Instant,
}

/// In-memory, per-process cache of active schedules with a short TTL
/// (spec §4.9 step 1). Deliberately not bucket-backed: it exists only to
/// spare the hot request path a bucket read on every call.
pub struct ScheduleCache {
    entries: Mutex<HashMap<String, CachedSchedule>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_fetch(
        &self,
        store: &dyn ObjectStore,
        function_id: &str,
    ) -> Result<Option<Schedule>, DispatchError> {
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(function_id) {
                if cached.fetched_at.elapsed() < SCHEDULE_CACHE_TTL {
                    return Ok(Some(cached.schedule.clone()));
                }
            }
        }

        let bytes = match store.get(&csched_cache::schedule_key(function_id)).await {
            Ok(b) => b,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let schedule: Schedule = serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::Malformed(e.to_string()))?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            function_id.to_string(),
            CachedSchedule {
                schedule: schedule.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(Some(schedule))
    }
}

impl Default for ScheduleCache {
    fn default() -> Self {
        Self::new()
    }
}

struct IdempotencyEntry {
    outcome: DispatchOutcome,
    recorded_at: Instant,
}

/// Rolling window of (function, request id) -> decision, so a retried
/// client request replays the original outcome instead of re-forwarding or
/// double-enqueuing (spec §4.9 "Idempotency", spec §8 invariant).
pub struct IdempotencyStore {
    entries: Mutex<HashMap<(String, String), IdempotencyEntry>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, function_id: &str, request_id: &str) -> Option<DispatchOutcome> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, v| v.recorded_at.elapsed() < IDEMPOTENCY_TTL);
        entries
            .get(&(function_id.to_string(), request_id.to_string()))
            .map(|e| e.outcome.clone())
    }

    async fn put(&self, function_id: &str, request_id: &str, outcome: DispatchOutcome) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (function_id.to_string(), request_id.to_string()),
            IdempotencyEntry {
                outcome,
                recorded_at: Instant::now(),
            },
        );
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort lookup of a function's `deadline_hours` straight out of the
/// registry document, without running it through the normalizer. The
/// dispatcher has no oracle of its own (wiring one in just to resolve one
/// field would mean every dispatch pulled in an LLM dependency); structured
/// descriptors carry `function_id` before normalization, so a match on that
/// field is enough. Free-text descriptors have no `function_id` until the
/// oracle extracts one and so can never match here, which just falls back
/// to the spec's own default — a dispatcher can only ever be asked about a
/// function that already has a schedule, and producing the schedule
/// already ran that function through the oracle.
async fn lookup_deadline_hours(store: &dyn ObjectStore, function_id: &str) -> u32 {
    let bytes = match store.get(csched_registry::REGISTRY_KEY).await {
        Ok(b) => b,
        Err(_) => return DEFAULT_DEADLINE_HOURS,
    };
    let Ok(descriptors) = serde_json::from_slice::<Vec<serde_json::Value>>(&bytes) else {
        return DEFAULT_DEADLINE_HOURS;
    };
    descriptors
        .iter()
        .find(|d| d.get("function_id").and_then(|v| v.as_str()) == Some(function_id))
        .and_then(|d| d.get("deadline_hours"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_DEADLINE_HOURS)
}

#[derive(Debug, Error, Clone)]
enum ForwardError {
    #[error("transient forward error: {0}")]
    Transient(String),
    #[error("forward request failed: {0}")]
    Permanent(String),
}

impl ForwardError {
    fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Transient(_))
    }
}

/// Wires the bucket, queue, and outbound HTTP client together to serve
/// `POST /dispatch/:function_id` (spec §4.9, §6).
pub struct Dispatcher {
    store: std::sync::Arc<dyn ObjectStore>,
    queue: std::sync::Arc<dyn QueueAdapter>,
    http: reqwest::Client,
    schedule_cache: ScheduleCache,
    idempotency: IdempotencyStore,
    telemetry: Option<std::sync::Arc<TelemetryLog>>,
    backoff: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(
        store: std::sync::Arc<dyn ObjectStore>,
        queue: std::sync::Arc<dyn QueueAdapter>,
        telemetry: Option<std::sync::Arc<TelemetryLog>>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            http: reqwest::Client::new(),
            schedule_cache: ScheduleCache::new(),
            idempotency: IdempotencyStore::new(),
            telemetry,
            backoff,
        }
    }

    fn emit(&self, function_id: &str, kind: EventKind, detail: impl Into<String>) {
        if let Some(log) = &self.telemetry {
            let event = EventBuilder::new("dispatch", kind)
                .function_id(function_id)
                .detail(detail)
                .build();
            if let Err(e) = log.append(event) {
                tracing::warn!(function_id, error = %e, "failed to append telemetry event");
            }
        }
    }

    pub async fn dispatch(
        &self,
        function_id: &str,
        payload: serde_json::Value,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if let Some(rid) = request_id {
            if let Some(cached) = self.idempotency.get(function_id, rid).await {
                return Ok(cached);
            }
        }

        let schedule = self
            .schedule_cache
            .get_or_fetch(self.store.as_ref(), function_id)
            .await?
            .ok_or_else(|| DispatchError::UnknownFunction(function_id.to_string()))?;

        let deadline_hours = lookup_deadline_hours(self.store.as_ref(), function_id).await;
        let candidates = candidate_order(&schedule, now, deadline_hours);

        let outcome = self
            .try_candidates(function_id, &schedule, &candidates, payload, now)
            .await?;

        if let Some(rid) = request_id {
            self.idempotency.put(function_id, rid, outcome.clone()).await;
        }
        Ok(outcome)
    }

    async fn try_candidates(
        &self,
        function_id: &str,
        schedule: &Schedule,
        candidates: &[Candidate],
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        // Distinguishes spec §7's two dispatcher failure codes: 503 when no
        // candidate ever had a deployed URL to try, 502 when one did and
        // forwarding/enqueuing to it was attempted and exhausted retries.
        let mut attempted = false;

        for candidate in candidates {
            let region = &candidate.recommendation.region;
            let Some(entry) = schedule.deployment.get(region) else {
                continue;
            };
            attempted = true;

            match candidate.kind {
                SlotKind::Now => match self.forward(&entry.url, &payload).await {
                    Ok(outcome) => {
                        self.emit(function_id, EventKind::Dispatched, format!("forwarded to {region}"));
                        return Ok(outcome);
                    }
                    Err(_) => continue,
                },
                SlotKind::Future => {
                    let task = DelayedTask::new(
                        entry.url.clone(),
                        payload.clone(),
                        candidate.recommendation.hour_start_utc,
                        now,
                    )
                    .map_err(|e| DispatchError::Upstream(e.to_string()))?;

                    match enqueue_with_retry(self.queue.as_ref(), &task, self.backoff).await {
                        Ok(task_id) => {
                            self.emit(
                                function_id,
                                EventKind::Deferred,
                                format!("enqueued to {region} for {}", candidate.recommendation.hour_start_utc),
                            );
                            return Ok(DispatchOutcome::Deferred {
                                task_id,
                                scheduled_for_utc: candidate.recommendation.hour_start_utc,
                            });
                        }
                        Err(_) => continue,
                    }
                }
            }
        }

        if attempted {
            self.emit(function_id, EventKind::Failed, "target region(s) failed after retries");
            Err(DispatchError::TargetExhausted)
        } else {
            self.emit(function_id, EventKind::Failed, "no viable slot within deadline");
            Err(DispatchError::NoViableSlot)
        }
    }

    async fn forward(&self, url: &str, payload: &serde_json::Value) -> Result<DispatchOutcome, ForwardError> {
        csched_types::retry_with_backoff(self.backoff, ForwardError::is_retryable, || async {
            let resp = self
                .http
                .post(url)
                .json(payload)
                .send()
                .await
                .map_err(|e| ForwardError::Transient(format!("request failed: {e}")))?;

            let status = resp.status();
            if status.is_server_error() {
                return Err(ForwardError::Transient(format!("server error: {status}")));
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|e| ForwardError::Permanent(format!("failed to read response body: {e}")))?
                .to_vec();

            Ok(DispatchOutcome::Forwarded {
                status: status.as_u16(),
                content_type,
                body,
            })
        })
        .await
    }
}
