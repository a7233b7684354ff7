//! Planner / ranking oracle (spec C6 / §4.5): selects and orders the
//! top-K (region, hour) candidates per function, in one of two equivalent
//! modes — deterministic (sort by composite score) or oracle-backed (LLM
//! permutation, validated, falling back to deterministic on any violation).

pub mod oracle;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use csched_types::schedule::ForecastMode;
use csched_types::{CandidateScore, DeploymentEntry, FunctionMetadata, Recommendation, Schedule};

pub use oracle::{validate_oracle_output, NullRankingOracle, OracleRankingResponse, RankingOracle, RankingOracleError};

/// Top-N candidates kept per function (spec §4.5 default 24).
pub const DEFAULT_TOP_N: usize = 24;

/// Planner state machine terminal/intermediate states (spec §4.5).
#[derive(Clone, Debug, PartialEq)]
pub enum CycleStatus {
    CachedHit,
    Scored,
    Ranked,
    Written,
    Failed(String),
    FailedTimeout,
}

/// Sort candidates by composite score ascending; ties broken by (i) earlier
/// hour, (ii) lower transfer cost, (iii) lexicographic region key (spec
/// §4.4). Returns at most `top_n` candidates.
pub fn rank_deterministic(mut candidates: Vec<CandidateScore>, top_n: usize) -> Vec<CandidateScore> {
    candidates.sort_by(|a, b| {
        a.composite_score
            .partial_cmp(&b.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hour_start.cmp(&b.hour_start))
            .then_with(|| {
                a.transfer_cost_usd
                    .partial_cmp(&b.transfer_cost_usd)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.region.cmp(&b.region))
    });
    candidates.truncate(top_n);
    candidates
}

/// Apply an already-validated oracle permutation to `candidates`, pairing
/// each selected candidate with its rationale string.
pub fn apply_oracle_order(
    candidates: &[CandidateScore],
    response: &OracleRankingResponse,
) -> Vec<(CandidateScore, String)> {
    response
        .order
        .iter()
        .zip(response.rationale.iter())
        .map(|(&idx, rationale)| (candidates[idx].clone(), rationale.clone()))
        .collect()
}

/// Build the schedule document from ranked candidates, assigning
/// priorities 1..N in order (spec §3, §6).
pub fn build_schedule(
    function_id: &str,
    horizon_start: DateTime<Utc>,
    generated_at: DateTime<Utc>,
    mode: ForecastMode,
    ranked: &[(CandidateScore, String)],
    metadata_hash: String,
    deployment: HashMap<String, DeploymentEntry>,
) -> Schedule {
    let recommendations = ranked
        .iter()
        .enumerate()
        .map(|(i, (candidate, rationale))| Recommendation {
            priority: (i + 1) as u32,
            region: candidate.region.clone(),
            hour_start_utc: candidate.hour_start,
            carbon_intensity_g_per_kwh: if candidate.energy_kwh.abs() < f64::EPSILON {
                0.0
            } else {
                candidate.emissions_g / candidate.energy_kwh
            },
            transfer_cost_usd: candidate.transfer_cost_usd,
            rationale: rationale.clone(),
        })
        .collect();

    Schedule {
        function_id: function_id.to_string(),
        horizon_start_utc: horizon_start,
        generated_at_utc: generated_at,
        mode,
        recommendations,
        deployment,
        metadata_hash,
    }
}

/// Rank `candidates` for `meta`, trying the oracle first if `oracle` is
/// `Some`, and falling back to deterministic mode on any oracle failure or
/// validation error (spec §4.5, §7).
pub async fn rank_candidates(
    candidates: Vec<CandidateScore>,
    meta: &FunctionMetadata,
    oracle: Option<&dyn RankingOracle>,
    top_n: usize,
) -> Vec<(CandidateScore, String)> {
    if let Some(oracle) = oracle {
        match oracle.rank(&candidates, meta, top_n).await {
            Ok(response) => match validate_oracle_output(&response, candidates.len()) {
                Ok(()) => {
                    tracing::info!(function_id = %meta.function_id, "planner used oracle ranking");
                    return apply_oracle_order(&candidates, &response);
                }
                Err(e) => {
                    tracing::warn!(function_id = %meta.function_id, error = %e, "oracle output failed validation, falling back to deterministic");
                }
            },
            Err(e) => {
                tracing::warn!(function_id = %meta.function_id, error = %e, "oracle ranking failed, falling back to deterministic");
            }
        }
    }

    let ranked = rank_deterministic(candidates, top_n);
    ranked
        .into_iter()
        .map(|c| {
            let rationale = format!(
                "deterministic: composite_score={:.4}",
                c.composite_score
            );
            (c, rationale)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use csched_types::Weights;

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    fn candidate(region: &str, hour_offset: i64, score: f64) -> CandidateScore {
        CandidateScore {
            function_id: "fn-1".into(),
            region: region.into(),
            hour_start: hour(hour_offset),
            energy_kwh: 1.0,
            emissions_g: 100.0,
            transfer_cost_usd: 0.0,
            composite_score: score,
        }
    }

    fn meta() -> FunctionMetadata {
        FunctionMetadata {
            function_id: "fn-1".into(),
            runtime_ms: 100,
            memory_mib: 128,
            vcpus: 1.0,
            gpu_required: false,
            gpu_type: None,
            input_bytes: 10,
            output_bytes: 10,
            source_region: "r1".into(),
            invocations_per_day: 1,
            allowed_regions: vec!["r1".into(), "r2".into()],
            weights: Weights::new(1.0, 0.0, 0.0).unwrap(),
            deadline_hours: 24,
            source: None,
        }
    }

    #[test]
    fn deterministic_ranking_sorts_by_score_then_hour_then_region() {
        let candidates = vec![
            candidate("r2", 1, 0.5),
            candidate("r1", 0, 0.5),
            candidate("r3", 0, 0.1),
        ];
        let ranked = rank_deterministic(candidates, 10);
        assert_eq!(ranked[0].region, "r3");
        assert_eq!(ranked[1].region, "r1");
        assert_eq!(ranked[2].region, "r2");
    }

    #[test]
    fn top_n_truncates() {
        let candidates: Vec<_> = (0..30).map(|i| candidate("r1", i, i as f64)).collect();
        let ranked = rank_deterministic(candidates, 24);
        assert_eq!(ranked.len(), 24);
    }

    struct AlwaysPermanentOracle;
    #[async_trait]
    impl RankingOracle for AlwaysPermanentOracle {
        async fn rank(
            &self,
            _candidates: &[CandidateScore],
            _meta: &FunctionMetadata,
            _top_n: usize,
        ) -> Result<OracleRankingResponse, RankingOracleError> {
            Err(RankingOracleError::Permanent("boom".into()))
        }
    }

    #[tokio::test]
    async fn oracle_failure_falls_back_to_deterministic() {
        let candidates = vec![candidate("r1", 0, 0.9), candidate("r2", 0, 0.1)];
        let ranked = rank_candidates(candidates, &meta(), Some(&AlwaysPermanentOracle), 24).await;
        assert_eq!(ranked[0].0.region, "r2");
    }

    struct InvalidPermutationOracle;
    #[async_trait]
    impl RankingOracle for InvalidPermutationOracle {
        async fn rank(
            &self,
            _candidates: &[CandidateScore],
            _meta: &FunctionMetadata,
            _top_n: usize,
        ) -> Result<OracleRankingResponse, RankingOracleError> {
            Ok(OracleRankingResponse {
                order: vec![0, 0],
                rationale: vec!["a".into(), "b".into()],
            })
        }
    }

    #[tokio::test]
    async fn invalid_oracle_output_falls_back_to_deterministic() {
        let candidates = vec![candidate("r1", 0, 0.9), candidate("r2", 0, 0.1)];
        let ranked = rank_candidates(candidates, &meta(), Some(&InvalidPermutationOracle), 24).await;
        assert_eq!(ranked[0].0.region, "r2");
    }

    struct ReversingOracle;
    #[async_trait]
    impl RankingOracle for ReversingOracle {
        async fn rank(
            &self,
            candidates: &[CandidateScore],
            _meta: &FunctionMetadata,
            _top_n: usize,
        ) -> Result<OracleRankingResponse, RankingOracleError> {
            let order: Vec<usize> = (0..candidates.len()).rev().collect();
            let rationale = order.iter().map(|i| format!("oracle picked {i}")).collect();
            Ok(OracleRankingResponse { order, rationale })
        }
    }

    #[tokio::test]
    async fn valid_oracle_output_is_used_as_is() {
        let candidates = vec![candidate("r1", 0, 0.9), candidate("r2", 0, 0.1)];
        let ranked = rank_candidates(candidates, &meta(), Some(&ReversingOracle), 24).await;
        assert_eq!(ranked[0].0.region, "r2");
        assert!(ranked[0].1.contains("oracle picked"));
    }

    #[test]
    fn build_schedule_assigns_sequential_priorities() {
        let ranked = vec![
            (candidate("r1", 0, 0.1), "best".to_string()),
            (candidate("r2", 1, 0.2), "second".to_string()),
        ];
        let schedule = build_schedule(
            "fn-1",
            hour(0),
            hour(0),
            ForecastMode::Forecast,
            &ranked,
            "hash".into(),
            HashMap::new(),
        );
        schedule.validate().unwrap();
        assert_eq!(schedule.recommendations[0].priority, 1);
        assert_eq!(schedule.recommendations[1].priority, 2);
    }
}
