//! Deployment orchestrator (spec C8 / §4.7): keeps each function deployed
//! in every region its top-M priorities reference, diffing against the
//! external deployer's content hash.

pub mod jsonrpc;

use std::collections::HashMap;

use chrono::Utc;
use csched_types::{canonical_json_bytes, sha256_hex, DeploymentEntry, FunctionMetadata, FunctionSource, Schedule};
use thiserror::Error;

pub use jsonrpc::JsonRpcDeployer;

/// Number of top-ranked regions the orchestrator realizes deployments for
/// (spec §4.7 default 3).
pub const DEFAULT_TOP_M: usize = 3;

#[derive(Debug, Error, Clone)]
pub enum DeployError {
    #[error("transient deployer error: {0}")]
    Transient(String),
    #[error("permanent deployer error: {0}")]
    Permanent(String),
}

impl DeployError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Transient(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeployedStatus {
    pub url: String,
    pub code_hash: String,
}

#[derive(Clone, Debug)]
pub struct DeployRequest {
    pub function_id: String,
    pub region: String,
    pub code: String,
    pub requirements: Vec<String>,
    pub memory_mib: u64,
    pub timeout_ms: u64,
}

/// External collaborator contract: JSON-RPC `deploy`/`status`/`delete`
/// (spec §6).
#[async_trait::async_trait]
pub trait Deployer: Send + Sync {
    async fn status(&self, function_id: &str, region: &str) -> Result<Option<DeployedStatus>, DeployError>;
    async fn deploy(&self, req: DeployRequest) -> Result<DeployedStatus, DeployError>;
    async fn delete(&self, function_id: &str, region: &str) -> Result<(), DeployError>;
    /// Mint a fresh function id for an ad-hoc submission (spec §6
    /// `generate_name`), given a human-readable hint (e.g. derived from the
    /// submitted code's first line).
    async fn generate_name(&self, hint: &str) -> Result<String, DeployError>;
}

/// Desired code hash: SHA-256 over canonical JSON of (code, sorted deps).
pub fn compute_code_hash(source: &FunctionSource) -> String {
    let mut deps = source.requirements.clone();
    deps.sort();
    let payload = serde_json::json!({ "code": source.code, "requirements": deps });
    let bytes = canonical_json_bytes(&payload).expect("json values always serialize");
    sha256_hex(&bytes)
}

#[derive(Clone, Debug)]
pub struct DeployOutcome {
    pub region: String,
    pub result: Result<DeploySkippedOrApplied, DeployError>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeploySkippedOrApplied {
    AlreadyCurrent,
    Deployed(DeploymentEntry),
}

/// Reconcile deployments for the top `top_m` priorities of `schedule`.
/// Per-region failures are non-fatal: the schedule's `deployment` map
/// retains any prior URL, and the failure is reported in the returned
/// outcomes for the caller to log as `deploy_failed` telemetry (spec §4.7,
/// §7).
pub async fn reconcile(
    schedule: &mut Schedule,
    meta: &FunctionMetadata,
    deployer: &dyn Deployer,
    top_m: usize,
    backoff: csched_types::BackoffPolicy,
) -> Vec<DeployOutcome> {
    let Some(source) = &meta.source else {
        tracing::debug!(function_id = %meta.function_id, "no deployable artifact, skipping deployment reconciliation");
        return Vec::new();
    };
    let desired_hash = compute_code_hash(source);

    let mut regions: Vec<String> = schedule
        .ranked()
        .into_iter()
        .take(top_m)
        .map(|r| r.region.clone())
        .collect();
    regions.dedup();

    let mut outcomes = Vec::with_capacity(regions.len());

    for region in regions {
        let outcome = reconcile_region(meta, &region, &desired_hash, source, deployer, backoff).await;
        if let Ok(DeploySkippedOrApplied::Deployed(entry)) = &outcome {
            schedule.deployment.insert(region.clone(), entry.clone());
        }
        outcomes.push(DeployOutcome {
            region,
            result: outcome,
        });
    }

    outcomes
}

async fn reconcile_region(
    meta: &FunctionMetadata,
    region: &str,
    desired_hash: &str,
    source: &FunctionSource,
    deployer: &dyn Deployer,
    backoff: csched_types::BackoffPolicy,
) -> Result<DeploySkippedOrApplied, DeployError> {
    let current = csched_types::retry_with_backoff(
        backoff,
        |e: &DeployError| e.is_retryable(),
        || deployer.status(&meta.function_id, region),
    )
    .await?;

    if let Some(status) = &current {
        if status.code_hash == desired_hash {
            return Ok(DeploySkippedOrApplied::AlreadyCurrent);
        }
    }

    let deployed = csched_types::retry_with_backoff(
        backoff,
        |e: &DeployError| e.is_retryable(),
        || {
            deployer.deploy(DeployRequest {
                function_id: meta.function_id.clone(),
                region: region.to_string(),
                code: source.code.clone(),
                requirements: source.requirements.clone(),
                memory_mib: meta.memory_mib,
                timeout_ms: meta.runtime_ms,
            })
        },
    )
    .await?;

    Ok(DeploySkippedOrApplied::Deployed(DeploymentEntry {
        url: deployed.url,
        code_hash: deployed.code_hash,
        deployed_at_utc: Utc::now(),
    }))
}

/// No-op deployer for local/offline runs (CLI demo, tests): reports every
/// function as never-deployed and "deploys" a synthetic URL without calling
/// out to a real function deployer.
pub struct NullDeployer;

#[async_trait::async_trait]
impl Deployer for NullDeployer {
    async fn status(&self, _function_id: &str, _region: &str) -> Result<Option<DeployedStatus>, DeployError> {
        Ok(None)
    }

    async fn deploy(&self, req: DeployRequest) -> Result<DeployedStatus, DeployError> {
        Ok(DeployedStatus {
            url: format!("https://{}.local.invalid/{}", req.region, req.function_id),
            code_hash: compute_code_hash(&FunctionSource {
                code: req.code,
                requirements: req.requirements,
            }),
        })
    }

    async fn delete(&self, _function_id: &str, _region: &str) -> Result<(), DeployError> {
        Ok(())
    }

    async fn generate_name(&self, hint: &str) -> Result<String, DeployError> {
        Ok(format!("{hint}-local"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use csched_types::schedule::ForecastMode;
    use csched_types::{Recommendation, Weights};
    use std::sync::Mutex;

    fn hour(n: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    fn meta_with_source() -> FunctionMetadata {
        FunctionMetadata {
            function_id: "fn-1".into(),
            runtime_ms: 1000,
            memory_mib: 256,
            vcpus: 1.0,
            gpu_required: false,
            gpu_type: None,
            input_bytes: 10,
            output_bytes: 10,
            source_region: "r1".into(),
            invocations_per_day: 10,
            allowed_regions: vec!["r1".into(), "r2".into()],
            weights: Weights::new(1.0, 0.0, 0.0).unwrap(),
            deadline_hours: 24,
            source: Some(FunctionSource {
                code: "def handler(): pass".into(),
                requirements: vec!["requests".into()],
            }),
        }
    }

    fn schedule_with_regions(regions: &[&str]) -> Schedule {
        let recommendations = regions
            .iter()
            .enumerate()
            .map(|(i, r)| Recommendation {
                priority: (i + 1) as u32,
                region: (*r).to_string(),
                hour_start_utc: hour(i as i64),
                carbon_intensity_g_per_kwh: 100.0,
                transfer_cost_usd: 0.0,
                rationale: String::new(),
            })
            .collect();
        Schedule {
            function_id: "fn-1".into(),
            horizon_start_utc: hour(0),
            generated_at_utc: hour(0),
            mode: ForecastMode::Forecast,
            recommendations,
            deployment: HashMap::new(),
            metadata_hash: "hash".into(),
        }
    }

    fn fast_backoff() -> csched_types::BackoffPolicy {
        csched_types::BackoffPolicy {
            base: std::time::Duration::from_millis(1),
            factor: 1,
            cap: std::time::Duration::from_millis(1),
            max_attempts: 2,
        }
    }

    struct FakeDeployer {
        statuses: Mutex<HashMap<String, DeployedStatus>>,
    }

    #[async_trait]
    impl Deployer for FakeDeployer {
        async fn status(&self, function_id: &str, region: &str) -> Result<Option<DeployedStatus>, DeployError> {
            Ok(self.statuses.lock().unwrap().get(&format!("{function_id}/{region}")).cloned())
        }
        async fn deploy(&self, req: DeployRequest) -> Result<DeployedStatus, DeployError> {
            let status = DeployedStatus {
                url: format!("https://{}.fn.example/{}", req.region, req.function_id),
                code_hash: compute_code_hash(&FunctionSource {
                    code: req.code,
                    requirements: req.requirements,
                }),
            };
            self.statuses
                .lock()
                .unwrap()
                .insert(format!("{}/{}", req.function_id, req.region), status.clone());
            Ok(status)
        }
        async fn delete(&self, function_id: &str, region: &str) -> Result<(), DeployError> {
            self.statuses.lock().unwrap().remove(&format!("{function_id}/{region}"));
            Ok(())
        }
        async fn generate_name(&self, hint: &str) -> Result<String, DeployError> {
            Ok(format!("{hint}-generated"))
        }
    }

    #[tokio::test]
    async fn deploys_missing_regions() {
        let deployer = FakeDeployer {
            statuses: Mutex::new(HashMap::new()),
        };
        let mut schedule = schedule_with_regions(&["r1", "r2"]);
        let meta = meta_with_source();
        let outcomes = reconcile(&mut schedule, &meta, &deployer, 2, fast_backoff()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(schedule.deployment.len(), 2);
    }

    #[tokio::test]
    async fn skips_already_current_region() {
        let code_hash = compute_code_hash(meta_with_source().source.as_ref().unwrap());
        let mut statuses = HashMap::new();
        statuses.insert(
            "fn-1/r1".to_string(),
            DeployedStatus {
                url: "https://old".into(),
                code_hash,
            },
        );
        let deployer = FakeDeployer {
            statuses: Mutex::new(statuses),
        };
        let mut schedule = schedule_with_regions(&["r1"]);
        let meta = meta_with_source();
        let outcomes = reconcile(&mut schedule, &meta, &deployer, 1, fast_backoff()).await;
        assert!(matches!(
            outcomes[0].result,
            Ok(DeploySkippedOrApplied::AlreadyCurrent)
        ));
        assert!(schedule.deployment.is_empty());
    }

    #[tokio::test]
    async fn top_m_limits_regions_considered() {
        let deployer = FakeDeployer {
            statuses: Mutex::new(HashMap::new()),
        };
        let mut schedule = schedule_with_regions(&["r1", "r2", "r3"]);
        let meta = meta_with_source();
        let outcomes = reconcile(&mut schedule, &meta, &deployer, 1, fast_backoff()).await;
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn no_source_skips_deployment_entirely() {
        let deployer = FakeDeployer {
            statuses: Mutex::new(HashMap::new()),
        };
        let mut schedule = schedule_with_regions(&["r1"]);
        let mut meta = meta_with_source();
        meta.source = None;
        let outcomes = reconcile(&mut schedule, &meta, &deployer, 3, fast_backoff()).await;
        assert!(outcomes.is_empty());
    }

    struct FailingDeployer;
    #[async_trait]
    impl Deployer for FailingDeployer {
        async fn status(&self, _function_id: &str, _region: &str) -> Result<Option<DeployedStatus>, DeployError> {
            Ok(None)
        }
        async fn deploy(&self, _req: DeployRequest) -> Result<DeployedStatus, DeployError> {
            Err(DeployError::Permanent("quota exceeded".into()))
        }
        async fn delete(&self, _function_id: &str, _region: &str) -> Result<(), DeployError> {
            Ok(())
        }
        async fn generate_name(&self, hint: &str) -> Result<String, DeployError> {
            Ok(format!("{hint}-generated"))
        }
    }

    #[tokio::test]
    async fn deploy_failure_is_non_fatal_and_schedule_keeps_no_url() {
        let mut schedule = schedule_with_regions(&["r1"]);
        let meta = meta_with_source();
        let outcomes = reconcile(&mut schedule, &meta, &FailingDeployer, 1, fast_backoff()).await;
        assert!(outcomes[0].result.is_err());
        assert!(schedule.deployment.is_empty());
    }
}
