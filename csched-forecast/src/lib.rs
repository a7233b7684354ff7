//! Forecast fetcher (spec C4 / §4.3): retrieves hourly carbon intensity per
//! zone, merges into one document, and persists it keyed by fetch time.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use csched_store::ObjectStore;
use csched_types::{BackoffPolicy, CarbonForecast};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

pub use http::HttpForecastProvider;

pub const FORECAST_KEY: &str = "carbon_forecasts.json";
pub const HORIZON_HOURS: usize = 24;
/// Bounded concurrency cap for parallel zone fetches (spec §5 default 8).
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Forecast,
    Historical,
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("invalid forecast payload: {0}")]
    Invalid(String),
}

impl ForecastError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForecastError::Transient(_))
    }
}

/// External collaborator contract: returns hourly CI for one zone.
#[async_trait::async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch_hourly(
        &self,
        zone: &str,
        mode: FetchMode,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError>;
}

/// Merged forecast document persisted at [`FORECAST_KEY`] (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergedForecastDocument {
    pub fetched_at_utc: DateTime<Utc>,
    pub mode: FetchMode,
    pub zones: HashMap<String, CarbonForecast>,
}

/// Fetch the union of `zones` concurrently (bounded by `concurrency`),
/// retrying each zone per `backoff`. If `startup_mode` is `Forecast` and a
/// zone's forecast-mode fetch exhausts its retries, that zone falls back to
/// historical mode: fetch the past 24h and reinterpret timestamps as the
/// next 24h (spec §4.3). The document's overall `mode` is `Historical` if
/// *any* zone fell back, so the planner can record which was used.
pub async fn fetch_cycle(
    provider: Arc<dyn ForecastProvider>,
    zones: &[String],
    startup_mode: FetchMode,
    concurrency: usize,
    backoff: BackoffPolicy,
    now: DateTime<Utc>,
) -> MergedForecastDocument {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(zones.len());

    for zone in zones {
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        let zone = zone.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let result = fetch_zone_with_fallback(provider.as_ref(), &zone, startup_mode, backoff, now).await;
            (zone, result)
        }));
    }

    let mut zones_out = HashMap::new();
    let mut any_historical = startup_mode == FetchMode::Historical;

    for handle in handles {
        let (zone, result) = handle.await.expect("forecast fetch task panicked");
        match result {
            Ok((mode, forecast)) => {
                if mode == FetchMode::Historical {
                    any_historical = true;
                }
                zones_out.insert(zone, forecast);
            }
            Err(e) => {
                tracing::warn!(zone, error = %e, "forecast fetch failed for zone after retries");
            }
        }
    }

    MergedForecastDocument {
        fetched_at_utc: now,
        mode: if any_historical {
            FetchMode::Historical
        } else {
            FetchMode::Forecast
        },
        zones: zones_out,
    }
}

async fn fetch_zone_with_fallback(
    provider: &dyn ForecastProvider,
    zone: &str,
    startup_mode: FetchMode,
    backoff: BackoffPolicy,
    now: DateTime<Utc>,
) -> Result<(FetchMode, CarbonForecast), ForecastError> {
    let primary = csched_types::retry_with_backoff(
        backoff,
        |e: &ForecastError| e.is_retryable(),
        || provider.fetch_hourly(zone, startup_mode),
    )
    .await;

    match primary {
        Ok(hours) => {
            let forecast = CarbonForecast::new(zone.to_string(), now, hours)
                .map_err(|e| ForecastError::Invalid(e.to_string()))?;
            Ok((startup_mode, forecast))
        }
        Err(e) if startup_mode == FetchMode::Forecast => {
            tracing::warn!(zone, error = %e, "forecast mode exhausted, falling back to historical");
            let historical = csched_types::retry_with_backoff(
                backoff,
                |e: &ForecastError| e.is_retryable(),
                || provider.fetch_hourly(zone, FetchMode::Historical),
            )
            .await?;
            let reinterpreted: Vec<(DateTime<Utc>, f64)> = historical
                .into_iter()
                .map(|(ts, v)| (ts + Duration::hours(24), v))
                .collect();
            let forecast = CarbonForecast::new(zone.to_string(), now, reinterpreted)
                .map_err(|e| ForecastError::Invalid(e.to_string()))?;
            Ok((FetchMode::Historical, forecast))
        }
        Err(e) => Err(e),
    }
}

pub async fn load_latest(store: &dyn ObjectStore) -> Result<MergedForecastDocument, csched_store::StoreError> {
    let bytes = store.get(FORECAST_KEY).await?;
    serde_json::from_slice(&bytes).map_err(|e| csched_store::StoreError::Io(e.to_string()))
}

/// Serves zones out of a [`MergedForecastDocument`] already sitting in the
/// bucket instead of calling a live HTTP provider. Used by the operator CLI
/// for one-off local runs (spec §4.3 describes the live contract; this is
/// the offline counterpart, grounded in the same "bucket is the source of
/// truth" rule spec §5 applies everywhere else). A zone absent from the
/// snapshot is a permanent error for that zone, matching the per-zone skip
/// semantics `fetch_cycle` already applies to a live provider failure.
pub struct StoreSnapshotForecastProvider {
    zones: HashMap<String, CarbonForecast>,
}

impl StoreSnapshotForecastProvider {
    pub async fn load(store: &dyn ObjectStore) -> Result<Self, csched_store::StoreError> {
        let doc = load_latest(store).await?;
        Ok(Self { zones: doc.zones })
    }

    /// No zones available; every `fetch_hourly` call is a permanent error.
    pub fn empty() -> Self {
        Self { zones: HashMap::new() }
    }
}

#[async_trait::async_trait]
impl ForecastProvider for StoreSnapshotForecastProvider {
    async fn fetch_hourly(
        &self,
        zone: &str,
        _mode: FetchMode,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError> {
        self.zones
            .get(zone)
            .map(|f| f.hours.clone())
            .ok_or_else(|| ForecastError::Permanent(format!("no snapshot forecast for zone {zone}")))
    }
}

pub async fn store_merged(
    store: &dyn ObjectStore,
    doc: &MergedForecastDocument,
) -> Result<(), csched_store::StoreError> {
    let bytes = serde_json::to_vec_pretty(doc).map_err(|e| csched_store::StoreError::Io(e.to_string()))?;
    store.put(FORECAST_KEY, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: std::time::Duration::from_millis(1),
            factor: 1,
            cap: std::time::Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    struct FlakyProvider {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl ForecastProvider for FlakyProvider {
        async fn fetch_hourly(
            &self,
            _zone: &str,
            _mode: FetchMode,
        ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(ForecastError::Transient("503".into()));
            }
            Ok((0..24).map(|i| (hour(i), 100.0)).collect())
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let provider = Arc::new(FlakyProvider {
            fail_times: AtomicU32::new(1),
        });
        let doc = fetch_cycle(
            provider,
            &["zone1".to_string()],
            FetchMode::Forecast,
            4,
            fast_backoff(),
            hour(0),
        )
        .await;
        assert_eq!(doc.mode, FetchMode::Forecast);
        assert_eq!(doc.zones.get("zone1").unwrap().len(), 24);
    }

    struct AlwaysFailsForecastProvider;

    #[async_trait]
    impl ForecastProvider for AlwaysFailsForecastProvider {
        async fn fetch_hourly(
            &self,
            _zone: &str,
            mode: FetchMode,
        ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError> {
            match mode {
                FetchMode::Forecast => Err(ForecastError::Transient("unavailable".into())),
                FetchMode::Historical => Ok((0..24).map(|i| (hour(i - 24), 42.0)).collect()),
            }
        }
    }

    #[tokio::test]
    async fn falls_back_to_historical_and_shifts_timestamps() {
        let provider = Arc::new(AlwaysFailsForecastProvider);
        let doc = fetch_cycle(
            provider,
            &["zone1".to_string()],
            FetchMode::Forecast,
            4,
            fast_backoff(),
            hour(0),
        )
        .await;
        assert_eq!(doc.mode, FetchMode::Historical);
        let forecast = doc.zones.get("zone1").unwrap();
        assert_eq!(forecast.hours[0].0, hour(0));
    }

    #[tokio::test]
    async fn multiple_zones_are_fetched_concurrently() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        struct RecordingProvider {
            calls: Arc<Mutex<Vec<String>>>,
        }
        #[async_trait]
        impl ForecastProvider for RecordingProvider {
            async fn fetch_hourly(
                &self,
                zone: &str,
                _mode: FetchMode,
            ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError> {
                self.calls.lock().unwrap().push(zone.to_string());
                Ok((0..24).map(|i| (hour(i), 10.0)).collect())
            }
        }
        let provider = Arc::new(RecordingProvider { calls: Arc::clone(&calls) });
        let zones = vec!["z1".to_string(), "z2".to_string(), "z3".to_string()];
        let doc = fetch_cycle(provider, &zones, FetchMode::Forecast, 2, fast_backoff(), hour(0)).await;
        assert_eq!(doc.zones.len(), 3);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }
}
