//! Static region catalog (spec C1 / §4.1): read-only power, pricing, and
//! carbon-zone facts per candidate region.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::metadata::TypesError;

pub type RegionKey = String;
pub type ZoneKey = String;

/// One region's entry in the static catalog. All power figures are watts;
/// `pue` is dimensionless.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RegionCatalogEntry {
    pub region: RegionKey,
    pub zone: ZoneKey,
    /// USD per GB egressed to each destination region, keyed by destination.
    pub egress_usd_per_gb: HashMap<RegionKey, f64>,
    pub cpu_min_w_per_vcpu: f64,
    pub cpu_max_w_per_vcpu: f64,
    pub mem_w_per_gib: f64,
    pub gpu_min_w: Option<f64>,
    pub gpu_max_w: Option<f64>,
    pub pue: f64,
    pub has_gpu: bool,
    /// Network energy per GB transferred, kWh/GB.
    pub network_kwh_per_gb: f64,
}

impl RegionCatalogEntry {
    fn validate(&self) -> Result<(), TypesError> {
        if self.cpu_max_w_per_vcpu < self.cpu_min_w_per_vcpu {
            return Err(TypesError::Invariant(format!(
                "region {}: cpu max W ({}) < min W ({})",
                self.region, self.cpu_max_w_per_vcpu, self.cpu_min_w_per_vcpu
            )));
        }
        if let (Some(min), Some(max)) = (self.gpu_min_w, self.gpu_max_w) {
            if max < min {
                return Err(TypesError::Invariant(format!(
                    "region {}: gpu max W ({max}) < min W ({min})",
                    self.region
                )));
            }
        }
        if !(1.0..=2.0).contains(&self.pue) {
            return Err(TypesError::Invariant(format!(
                "region {}: pue {} outside [1.0, 2.0]",
                self.region, self.pue
            )));
        }
        if self.has_gpu && (self.gpu_min_w.is_none() || self.gpu_max_w.is_none()) {
            return Err(TypesError::Invariant(format!(
                "region {}: has_gpu but missing gpu power range",
                self.region
            )));
        }
        Ok(())
    }
}

/// Read-only lookups over the region catalog. Loaded once at startup; no
/// hot-reload contract (spec §4.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticCatalog {
    regions: HashMap<RegionKey, RegionCatalogEntry>,
}

impl StaticCatalog {
    pub fn from_entries(entries: Vec<RegionCatalogEntry>) -> Result<Self, TypesError> {
        let mut regions = HashMap::with_capacity(entries.len());
        for entry in entries {
            entry.validate()?;
            regions.insert(entry.region.clone(), entry);
        }
        Ok(Self { regions })
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionKey> {
        self.regions.keys()
    }

    pub fn entry(&self, region: &str) -> Option<&RegionCatalogEntry> {
        self.regions.get(region)
    }

    pub fn zone_of(&self, region: &str) -> Option<&ZoneKey> {
        self.regions.get(region).map(|e| &e.zone)
    }

    pub fn egress_rate(&self, from_region: &str, to_region: &str) -> Option<f64> {
        self.regions
            .get(from_region)
            .and_then(|e| e.egress_usd_per_gb.get(to_region).copied())
    }

    pub fn has_gpu(&self, region: &str) -> bool {
        self.regions.get(region).map(|e| e.has_gpu).unwrap_or(false)
    }

    pub fn contains(&self, region: &str) -> bool {
        self.regions.contains_key(region)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
