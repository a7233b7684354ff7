//! Function metadata (spec §3 `FunctionMetadata`) and the priority weights
//! that drive candidate scoring.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{RegionKey, StaticCatalog};
use crate::FunctionId;

#[derive(Debug, Error, PartialEq)]
pub enum TypesError {
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Three nonnegative weights over {carbon, cost, latency} summing to 1.
///
/// The source system sometimes expressed this as a single "priority"
/// integer (design note, spec §9); this crate only accepts the normalized
/// three-weight form and rejects anything that doesn't sum to ~1.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Weights {
    pub carbon: f64,
    pub cost: f64,
    pub latency: f64,
}

const WEIGHT_SUM_EPSILON: f64 = 1e-6;

impl Weights {
    pub fn new(carbon: f64, cost: f64, latency: f64) -> Result<Self, TypesError> {
        let w = Self {
            carbon,
            cost,
            latency,
        };
        w.validate()?;
        Ok(w)
    }

    fn validate(&self) -> Result<(), TypesError> {
        if self.carbon < 0.0 || self.cost < 0.0 || self.latency < 0.0 {
            return Err(TypesError::Invariant(
                "weights must be nonnegative".into(),
            ));
        }
        let sum = self.carbon + self.cost + self.latency;
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(TypesError::Invariant(format!(
                "weights must sum to 1, got {sum}"
            )));
        }
        if sum <= 0.0 {
            return Err(TypesError::Invariant(
                "at least one weight must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// An optional deployable artifact: source text plus a dependency list, used
/// by the deployment orchestrator (C8) to compute a code hash and deploy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionSource {
    pub code: String,
    pub requirements: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionMetadata {
    pub function_id: FunctionId,
    pub runtime_ms: u64,
    pub memory_mib: u64,
    pub vcpus: f64,
    pub gpu_required: bool,
    pub gpu_type: Option<String>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub source_region: RegionKey,
    pub invocations_per_day: u64,
    pub allowed_regions: Vec<RegionKey>,
    pub weights: Weights,
    /// Max acceptable deferral in hours; defaults to 24 when absent at the
    /// registry layer (see `csched-registry`).
    pub deadline_hours: u32,
    pub source: Option<FunctionSource>,
}

impl FunctionMetadata {
    /// Validate the cross-field invariants from spec §3. `catalog` is
    /// required because "allowed is a nonempty subset of catalog regions"
    /// and the GPU-availability check both need it.
    pub fn validate(&self, catalog: &StaticCatalog) -> Result<(), TypesError> {
        if self.allowed_regions.is_empty() {
            return Err(TypesError::Invariant(
                "allowed_regions must be nonempty".into(),
            ));
        }
        for region in &self.allowed_regions {
            if !catalog.contains(region) {
                return Err(TypesError::Invariant(format!(
                    "allowed region {region} is not a known catalog key"
                )));
            }
        }
        if self.gpu_required {
            let any_gpu = self
                .allowed_regions
                .iter()
                .any(|r| catalog.has_gpu(r));
            if !any_gpu {
                return Err(TypesError::Invariant(
                    "gpu_required but no allowed region has a GPU".into(),
                ));
            }
        }
        self.weights.validate()?;
        Ok(())
    }
}
