//! Per-function schedule document (spec §3 `Schedule`, §6 "bit-exact shape").

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::RegionKey;
use crate::metadata::TypesError;
use crate::FunctionId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ForecastMode {
    Forecast,
    Historical,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub priority: u32,
    pub region: RegionKey,
    pub hour_start_utc: DateTime<Utc>,
    pub carbon_intensity_g_per_kwh: f64,
    pub transfer_cost_usd: f64,
    pub rationale: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeploymentEntry {
    pub url: String,
    pub code_hash: String,
    pub deployed_at_utc: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub function_id: FunctionId,
    pub horizon_start_utc: DateTime<Utc>,
    pub generated_at_utc: DateTime<Utc>,
    pub mode: ForecastMode,
    pub recommendations: Vec<Recommendation>,
    pub deployment: HashMap<RegionKey, DeploymentEntry>,
    pub metadata_hash: String,
}

impl Schedule {
    /// Validate the invariants from spec §3 and §8: recommendations unique
    /// by (region, hour); priorities are 1..N without gaps; first-ranked
    /// slot's hour ≥ horizon start.
    pub fn validate(&self) -> Result<(), TypesError> {
        let n = self.recommendations.len();
        let mut seen_priorities: HashSet<u32> = HashSet::with_capacity(n);
        let mut seen_slots: HashSet<(RegionKey, DateTime<Utc>)> = HashSet::with_capacity(n);

        for rec in &self.recommendations {
            if rec.priority == 0 || rec.priority as usize > n {
                return Err(TypesError::Invariant(format!(
                    "priority {} out of range 1..={n}",
                    rec.priority
                )));
            }
            if !seen_priorities.insert(rec.priority) {
                return Err(TypesError::Invariant(format!(
                    "duplicate priority {}",
                    rec.priority
                )));
            }
            let slot = (rec.region.clone(), rec.hour_start_utc);
            if !seen_slots.insert(slot) {
                return Err(TypesError::Invariant(format!(
                    "duplicate (region, hour) slot: {} @ {}",
                    rec.region, rec.hour_start_utc
                )));
            }
        }

        if seen_priorities.len() != n {
            return Err(TypesError::Invariant(
                "priorities are not a permutation of 1..=N".into(),
            ));
        }

        if let Some(first) = self.recommendations.iter().find(|r| r.priority == 1) {
            if first.hour_start_utc < self.horizon_start_utc {
                return Err(TypesError::Invariant(
                    "first-ranked slot's hour is before horizon start".into(),
                ));
            }
        }

        Ok(())
    }

    /// Recommendations in priority order (1, 2, 3, ...).
    pub fn ranked(&self) -> Vec<&Recommendation> {
        let mut out: Vec<&Recommendation> = self.recommendations.iter().collect();
        out.sort_by_key(|r| r.priority);
        out
    }
}
