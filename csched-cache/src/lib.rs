//! Plan cache (spec C7 / §4.6): a schedule is reusable if its cache key
//! (function id, SHA-256 of canonical-JSON metadata, horizon start date)
//! matches and it is no older than `MAX_AGE`.

use chrono::{DateTime, Duration, Utc};
use csched_store::ObjectStore;
use csched_types::{canonical_json_bytes, sha256_hex, FunctionMetadata, PlanCacheKey, Schedule};
use thiserror::Error;

pub const MAX_SCHEDULE_AGE: Duration = Duration::days(7);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] csched_store::StoreError),
    #[error("failed to hash metadata: {0}")]
    Hash(#[from] serde_json::Error),
    #[error("failed to parse cached schedule: {0}")]
    Parse(serde_json::Error),
}

pub fn schedule_key(function_id: &str) -> String {
    format!("schedule_{function_id}.json")
}

/// Compute the cache key for `metadata` over the horizon starting at
/// `horizon_start`. SHA-256 over canonical JSON means any metadata change
/// avalanches the key (spec §8 property).
pub fn compute_key(
    metadata: &FunctionMetadata,
    horizon_start: DateTime<Utc>,
) -> Result<PlanCacheKey, CacheError> {
    let bytes = canonical_json_bytes(metadata)?;
    let hash = sha256_hex(&bytes);
    Ok(PlanCacheKey::new(
        metadata.function_id.clone(),
        hash,
        horizon_start,
    ))
}

/// Look up a previously written schedule for `key`. Returns `Some` only if
/// the stored schedule's `metadata_hash` matches and it's within
/// `MAX_SCHEDULE_AGE` of `now`; any other case (missing, mismatched,
/// expired, unparsable) is a cache miss (spec §7: torn/garbled reads are
/// treated as a miss, never surfaced to the caller).
pub async fn lookup(
    store: &dyn ObjectStore,
    key: &PlanCacheKey,
    now: DateTime<Utc>,
) -> Result<Option<Schedule>, CacheError> {
    let obj_key = schedule_key(&key.function_id);
    let bytes = match store.get(&obj_key).await {
        Ok(b) => b,
        Err(csched_store::StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let schedule: Schedule = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };

    if schedule.metadata_hash != key.metadata_hash_hex {
        return Ok(None);
    }
    if schedule.horizon_start_utc.date_naive() != key.horizon_start_date {
        return Ok(None);
    }
    let age = now - schedule.generated_at_utc;
    if age > MAX_SCHEDULE_AGE {
        tracing::debug!(function_id = %key.function_id, "cached schedule expired");
        return Ok(None);
    }

    Ok(Some(schedule))
}

/// Persist a schedule. The planner is responsible for having already
/// validated it (spec §4.5 state machine); this just serializes and hands
/// off to the store's atomic write.
pub async fn store_schedule(store: &dyn ObjectStore, schedule: &Schedule) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec_pretty(schedule).map_err(CacheError::Hash)?;
    store.put(&schedule_key(&schedule.function_id), bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use csched_store::InMemoryObjectStore;
    use csched_types::schedule::ForecastMode;
    use csched_types::Weights;
    use std::collections::HashMap;

    fn meta(function_id: &str) -> FunctionMetadata {
        FunctionMetadata {
            function_id: function_id.into(),
            runtime_ms: 100,
            memory_mib: 128,
            vcpus: 1.0,
            gpu_required: false,
            gpu_type: None,
            input_bytes: 10,
            output_bytes: 10,
            source_region: "r1".into(),
            invocations_per_day: 1,
            allowed_regions: vec!["r1".into()],
            weights: Weights::new(1.0, 0.0, 0.0).unwrap(),
            deadline_hours: 24,
            source: None,
        }
    }

    fn schedule_for(key: &PlanCacheKey, horizon_start: DateTime<Utc>, generated_at: DateTime<Utc>) -> Schedule {
        Schedule {
            function_id: key.function_id.clone(),
            horizon_start_utc: horizon_start,
            generated_at_utc: generated_at,
            mode: ForecastMode::Forecast,
            recommendations: vec![],
            deployment: HashMap::new(),
            metadata_hash: key.metadata_hash_hex.clone(),
        }
    }

    #[test]
    fn key_avalanches_on_metadata_change() {
        let horizon = Utc::now();
        let m1 = meta("fn-a");
        let mut m2 = m1.clone();
        m2.memory_mib += 1;
        let k1 = compute_key(&m1, horizon).unwrap();
        let k2 = compute_key(&m2, horizon).unwrap();
        assert_ne!(k1.metadata_hash_hex, k2.metadata_hash_hex);
    }

    #[tokio::test]
    async fn fresh_matching_schedule_is_a_hit() {
        let store = InMemoryObjectStore::new();
        let horizon = Utc::now();
        let metadata = meta("fn-a");
        let key = compute_key(&metadata, horizon).unwrap();
        let schedule = schedule_for(&key, horizon, Utc::now());
        store_schedule(&store, &schedule).await.unwrap();

        let found = lookup(&store, &key, Utc::now()).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn expired_schedule_is_a_miss() {
        let store = InMemoryObjectStore::new();
        let horizon = Utc::now();
        let metadata = meta("fn-a");
        let key = compute_key(&metadata, horizon).unwrap();
        let generated_at = Utc::now() - Duration::days(8);
        let schedule = schedule_for(&key, horizon, generated_at);
        store_schedule(&store, &schedule).await.unwrap();

        let found = lookup(&store, &key, Utc::now()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn mismatched_key_is_a_miss() {
        let store = InMemoryObjectStore::new();
        let horizon = Utc::now();
        let metadata = meta("fn-a");
        let key = compute_key(&metadata, horizon).unwrap();
        let mut schedule = schedule_for(&key, horizon, Utc::now());
        schedule.metadata_hash = "different".into();
        store_schedule(&store, &schedule).await.unwrap();

        let found = lookup(&store, &key, Utc::now()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn missing_schedule_is_a_miss() {
        let store = InMemoryObjectStore::new();
        let metadata = meta("fn-a");
        let key = compute_key(&metadata, Utc::now()).unwrap();
        assert!(lookup(&store, &key, Utc::now()).await.unwrap().is_none());
    }
}
