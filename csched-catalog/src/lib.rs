//! Static catalog loading (spec C1 / §4.1): `static_config.json` is read
//! once at startup; failure to load is fatal, by contract, so this crate
//! never retries and never hot-reloads.

use csched_store::ObjectStore;
use csched_types::catalog::{RegionCatalogEntry, StaticCatalog};
use thiserror::Error;

pub const STATIC_CONFIG_KEY: &str = "static_config.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to load static catalog: {0}")]
    Load(#[from] csched_store::StoreError),
    #[error("failed to parse static catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("static catalog invalid: {0}")]
    Invalid(#[from] csched_types::metadata::TypesError),
}

/// Load and validate the static catalog from the bucket. Any error here is
/// meant to be fatal at process startup (spec §7 "configuration errors").
pub async fn load_catalog(store: &dyn ObjectStore) -> Result<StaticCatalog, CatalogError> {
    let bytes = store.get(STATIC_CONFIG_KEY).await?;
    let entries: Vec<RegionCatalogEntry> = serde_json::from_slice(&bytes)?;
    let catalog = StaticCatalog::from_entries(entries)?;
    tracing::info!(regions = catalog.len(), "static catalog loaded");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use csched_store::InMemoryObjectStore;
    use std::collections::HashMap;

    fn sample_entry(region: &str) -> RegionCatalogEntry {
        RegionCatalogEntry {
            region: region.into(),
            zone: format!("zone-{region}"),
            egress_usd_per_gb: HashMap::new(),
            cpu_min_w_per_vcpu: 2.0,
            cpu_max_w_per_vcpu: 8.0,
            mem_w_per_gib: 0.3,
            gpu_min_w: None,
            gpu_max_w: None,
            pue: 1.2,
            has_gpu: false,
            network_kwh_per_gb: 0.01,
        }
    }

    #[tokio::test]
    async fn loads_valid_catalog() {
        let store = InMemoryObjectStore::new();
        let entries = vec![sample_entry("r1"), sample_entry("r2")];
        store
            .put(STATIC_CONFIG_KEY, serde_json::to_vec(&entries).unwrap())
            .await
            .unwrap();
        let catalog = load_catalog(&store).await.unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn missing_catalog_is_an_error() {
        let store = InMemoryObjectStore::new();
        assert!(load_catalog(&store).await.is_err());
    }

    #[tokio::test]
    async fn malformed_catalog_is_an_error() {
        let store = InMemoryObjectStore::new();
        store
            .put(STATIC_CONFIG_KEY, b"not json".to_vec())
            .await
            .unwrap();
        assert!(load_catalog(&store).await.is_err());
    }
}
