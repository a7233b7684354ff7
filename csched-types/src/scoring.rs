//! Derived, non-persisted scoring types (spec §3 `CandidateScore`,
//! `PlanCacheKey`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::RegionKey;
use crate::FunctionId;

/// (function, region, hour) scored candidate. Never persisted: reproducible
/// from metadata + catalog + forecast, per spec §3 invariant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateScore {
    pub function_id: FunctionId,
    pub region: RegionKey,
    pub hour_start: DateTime<Utc>,
    pub energy_kwh: f64,
    pub emissions_g: f64,
    pub transfer_cost_usd: f64,
    /// Composite score to *minimize* (spec §4.4); populated only after
    /// min-max normalization across the full candidate set for a function.
    pub composite_score: f64,
}

/// Cache key for a function's schedule (spec §3 `PlanCacheKey`): schedules
/// bearing an equal key are interchangeable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub function_id: FunctionId,
    pub metadata_hash_hex: String,
    pub horizon_start_date: NaiveDate,
}

impl PlanCacheKey {
    pub fn new(function_id: FunctionId, metadata_hash_hex: String, horizon_start: DateTime<Utc>) -> Self {
        Self {
            function_id,
            metadata_hash_hex,
            horizon_start_date: horizon_start.date_naive(),
        }
    }
}
