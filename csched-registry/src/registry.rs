//! Function registry (spec C2): loads the registry document from the
//! bucket at the start of each planning cycle and normalizes every
//! descriptor (structured or free-text) into a `FunctionMetadata`.

use std::collections::HashMap;

use csched_store::ObjectStore;
use csched_types::{BackoffPolicy, FunctionMetadata, FunctionSource, StaticCatalog, Weights};
use serde::Deserialize;
use thiserror::Error;

use crate::oracle::{NormalizationOracle, OracleError, MIN_CONFIDENCE};

pub const REGISTRY_KEY: &str = "function_metadata.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] csched_store::StoreError),
    #[error("registry document is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RegistryDescriptor {
    Structured(StructuredInput),
    FreeText { description: String },
}

#[derive(Clone, Debug, Deserialize)]
struct WeightsInput {
    carbon: f64,
    cost: f64,
    latency: f64,
}

#[derive(Clone, Debug, Deserialize)]
struct StructuredInput {
    function_id: String,
    runtime_ms: u64,
    memory_mib: u64,
    vcpus: f64,
    #[serde(default)]
    gpu_required: bool,
    #[serde(default)]
    gpu_type: Option<String>,
    input_bytes: u64,
    output_bytes: u64,
    source_region: String,
    invocations_per_day: u64,
    allowed_regions: Vec<String>,
    #[serde(default)]
    weights: Option<WeightsInput>,
    /// Legacy single-integer priority scheme (spec §9 open question): any
    /// descriptor still using it is rejected rather than guessed at.
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    deadline_hours: Option<u32>,
    #[serde(default)]
    source: Option<FunctionSource>,
}

const DEFAULT_DEADLINE_HOURS: u32 = 24;

#[derive(Clone, Debug)]
pub struct RejectedFunction {
    pub function_id: Option<String>,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct RegistryOutcome {
    pub accepted: Vec<FunctionMetadata>,
    pub rejected: Vec<RejectedFunction>,
}

/// Load `function_metadata.json` and normalize every descriptor. A
/// malformed top-level document is a fatal configuration error (spec §7);
/// everything else (a bad individual descriptor, a low-confidence or
/// failed oracle extraction) only rejects that one function and the cycle
/// continues (spec §4.2).
pub async fn load_registry(
    store: &dyn ObjectStore,
    oracle: &dyn NormalizationOracle,
    catalog: &StaticCatalog,
    backoff: BackoffPolicy,
) -> Result<RegistryOutcome, RegistryError> {
    let bytes = store.get(REGISTRY_KEY).await?;
    let descriptors: Vec<RegistryDescriptor> = serde_json::from_slice(&bytes)?;

    let mut outcome = RegistryOutcome::default();
    let region_list: Vec<String> = catalog.regions().cloned().collect();

    for descriptor in descriptors {
        match descriptor {
            RegistryDescriptor::Structured(input) => {
                match normalize_structured(input, catalog) {
                    Ok(meta) => outcome.accepted.push(meta),
                    Err(rejected) => outcome.rejected.push(rejected),
                }
            }
            RegistryDescriptor::FreeText { description } => {
                match normalize_free_text(&description, oracle, catalog, &region_list, backoff).await {
                    Ok(meta) => outcome.accepted.push(meta),
                    Err(rejected) => outcome.rejected.push(rejected),
                }
            }
        }
    }

    Ok(outcome)
}

fn normalize_structured(
    input: StructuredInput,
    catalog: &StaticCatalog,
) -> Result<FunctionMetadata, RejectedFunction> {
    if input.priority.is_some() {
        return Err(RejectedFunction {
            function_id: Some(input.function_id.clone()),
            reason: "legacy single-priority scheme is not supported; use three-weight form".into(),
        });
    }
    let weights = match input.weights {
        Some(w) => Weights::new(w.carbon, w.cost, w.latency).map_err(|e| RejectedFunction {
            function_id: Some(input.function_id.clone()),
            reason: e.to_string(),
        })?,
        None => {
            return Err(RejectedFunction {
                function_id: Some(input.function_id.clone()),
                reason: "missing weights".into(),
            })
        }
    };

    let meta = FunctionMetadata {
        function_id: input.function_id.clone(),
        runtime_ms: input.runtime_ms,
        memory_mib: input.memory_mib,
        vcpus: input.vcpus,
        gpu_required: input.gpu_required,
        gpu_type: input.gpu_type,
        input_bytes: input.input_bytes,
        output_bytes: input.output_bytes,
        source_region: input.source_region,
        invocations_per_day: input.invocations_per_day,
        allowed_regions: input.allowed_regions,
        weights,
        deadline_hours: input.deadline_hours.unwrap_or(DEFAULT_DEADLINE_HOURS),
        source: input.source,
    };

    meta.validate(catalog).map_err(|e| RejectedFunction {
        function_id: Some(meta.function_id.clone()),
        reason: e.to_string(),
    })?;

    Ok(meta)
}

async fn normalize_free_text(
    description: &str,
    oracle: &dyn NormalizationOracle,
    catalog: &StaticCatalog,
    region_list: &[String],
    backoff: BackoffPolicy,
) -> Result<FunctionMetadata, RejectedFunction> {
    let extraction = csched_types::retry_with_backoff(
        backoff,
        |e: &OracleError| e.is_retryable(),
        || oracle.extract(description, region_list),
    )
    .await
    .map_err(|e| RejectedFunction {
        function_id: None,
        reason: format!("oracle extraction failed: {e}"),
    })?;

    if extraction.confidence < MIN_CONFIDENCE {
        return Err(RejectedFunction {
            function_id: Some(extraction.record.function_id.clone()),
            reason: format!(
                "oracle confidence {:.2} below minimum {MIN_CONFIDENCE:.2}",
                extraction.confidence
            ),
        });
    }

    if !extraction.warnings.is_empty() {
        tracing::warn!(
            function_id = %extraction.record.function_id,
            warnings = ?extraction.warnings,
            "oracle extraction produced warnings"
        );
    }
    tracing::info!(
        function_id = %extraction.record.function_id,
        confidence = extraction.confidence,
        assumptions = ?extraction.assumptions,
        "accepted oracle-normalized function"
    );

    extraction
        .record
        .validate(catalog)
        .map_err(|e| RejectedFunction {
            function_id: Some(extraction.record.function_id.clone()),
            reason: e.to_string(),
        })?;

    Ok(extraction.record)
}

/// Build a lookup by function id for convenience at call sites.
pub fn index_by_id(metas: &[FunctionMetadata]) -> HashMap<String, &FunctionMetadata> {
    metas.iter().map(|m| (m.function_id.clone(), m)).collect()
}
