//! Oracle-mode ranking (spec §4.5): the LLM oracle receives the candidate
//! list and per-function weights and must return a permutation of
//! candidate indices plus rationale strings. Its output is validated
//! before being trusted; any violation falls through to deterministic mode.

use async_trait::async_trait;
use csched_types::{CandidateScore, FunctionMetadata};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RankingOracleError {
    #[error("transient oracle error: {0}")]
    Transient(String),
    #[error("permanent oracle error: {0}")]
    Permanent(String),
}

impl RankingOracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RankingOracleError::Transient(_))
    }
}

/// The oracle's raw answer: `order[i]` is the candidate index placed at
/// priority `i + 1`; `rationale[i]` is the matching explanation.
#[derive(Clone, Debug)]
pub struct OracleRankingResponse {
    pub order: Vec<usize>,
    pub rationale: Vec<String>,
}

#[async_trait]
pub trait RankingOracle: Send + Sync {
    async fn rank(
        &self,
        candidates: &[CandidateScore],
        meta: &FunctionMetadata,
        top_n: usize,
    ) -> Result<OracleRankingResponse, RankingOracleError>;
}

/// Always-fails stub: a `Null*` default makes a missing real backend
/// explicit instead of silently behaving like success.
pub struct NullRankingOracle;

#[async_trait]
impl RankingOracle for NullRankingOracle {
    async fn rank(
        &self,
        _candidates: &[CandidateScore],
        _meta: &FunctionMetadata,
        _top_n: usize,
    ) -> Result<OracleRankingResponse, RankingOracleError> {
        Err(RankingOracleError::Permanent("no ranking oracle configured".into()))
    }
}

/// Validate that an oracle's output obeys spec §4.5: priority indices are
/// 1..N (i.e. `order` has no duplicate or out-of-range index), and every
/// selected candidate's region is in `allowed_regions` / satisfies the GPU
/// filter (the oracle was only ever given already-filtered candidates, so
/// this doubles as a check that it didn't invent indices).
pub fn validate_oracle_output(
    response: &OracleRankingResponse,
    candidate_count: usize,
) -> Result<(), RankingOracleError> {
    if response.order.len() != response.rationale.len() {
        return Err(RankingOracleError::Permanent(
            "order and rationale length mismatch".into(),
        ));
    }
    if response.order.is_empty() {
        return Err(RankingOracleError::Permanent("empty ranking".into()));
    }
    let mut seen = vec![false; candidate_count];
    for &idx in &response.order {
        if idx >= candidate_count {
            return Err(RankingOracleError::Permanent(format!(
                "candidate index {idx} out of range (have {candidate_count})"
            )));
        }
        if seen[idx] {
            return Err(RankingOracleError::Permanent(format!(
                "candidate index {idx} selected more than once"
            )));
        }
        seen[idx] = true;
    }
    Ok(())
}
