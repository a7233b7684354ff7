pub mod oracle;
pub mod registry;

pub use oracle::{
    HttpNormalizationOracle, NormalizationOracle, NullOracle, OracleError, OracleExtraction, MIN_CONFIDENCE,
};
pub use registry::{load_registry, RegistryError, RegistryOutcome, RejectedFunction, REGISTRY_KEY};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use csched_store::{InMemoryObjectStore, ObjectStore};
    use csched_types::catalog::RegionCatalogEntry;
    use csched_types::{BackoffPolicy, FunctionMetadata, StaticCatalog, Weights};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn catalog() -> StaticCatalog {
        StaticCatalog::from_entries(vec![RegionCatalogEntry {
            region: "r1".into(),
            zone: "zone1".into(),
            egress_usd_per_gb: HashMap::new(),
            cpu_min_w_per_vcpu: 2.0,
            cpu_max_w_per_vcpu: 8.0,
            mem_w_per_gib: 0.3,
            gpu_min_w: None,
            gpu_max_w: None,
            pue: 1.2,
            has_gpu: false,
            network_kwh_per_gb: 0.01,
        }])
        .unwrap()
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: std::time::Duration::from_millis(1),
            factor: 1,
            cap: std::time::Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn structured_descriptor_is_accepted() {
        let store = InMemoryObjectStore::new();
        let doc = serde_json::json!([
            {
                "function_id": "fn-a",
                "runtime_ms": 100,
                "memory_mib": 128,
                "vcpus": 1.0,
                "input_bytes": 10,
                "output_bytes": 10,
                "source_region": "r1",
                "invocations_per_day": 10,
                "allowed_regions": ["r1"],
                "weights": {"carbon": 1.0, "cost": 0.0, "latency": 0.0}
            }
        ]);
        store
            .put(REGISTRY_KEY, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let outcome = load_registry(&store, &NullOracle, &catalog(), fast_backoff())
            .await
            .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test]
    async fn legacy_priority_scheme_is_rejected() {
        let store = InMemoryObjectStore::new();
        let doc = serde_json::json!([
            {
                "function_id": "fn-a",
                "runtime_ms": 100,
                "memory_mib": 128,
                "vcpus": 1.0,
                "input_bytes": 10,
                "output_bytes": 10,
                "source_region": "r1",
                "invocations_per_day": 10,
                "allowed_regions": ["r1"],
                "priority": 5
            }
        ]);
        store
            .put(REGISTRY_KEY, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let outcome = load_registry(&store, &NullOracle, &catalog(), fast_backoff())
            .await
            .unwrap();
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
    }

    struct StubOracle {
        confidence: f64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NormalizationOracle for StubOracle {
        async fn extract(
            &self,
            _description: &str,
            _catalog_regions: &[String],
        ) -> Result<OracleExtraction, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OracleExtraction {
                record: FunctionMetadata {
                    function_id: "fn-text".into(),
                    runtime_ms: 100,
                    memory_mib: 128,
                    vcpus: 1.0,
                    gpu_required: false,
                    gpu_type: None,
                    input_bytes: 10,
                    output_bytes: 10,
                    source_region: "r1".into(),
                    invocations_per_day: 10,
                    allowed_regions: vec!["r1".into()],
                    weights: Weights::new(1.0, 0.0, 0.0).unwrap(),
                    deadline_hours: 6,
                    source: None,
                },
                confidence: self.confidence,
                assumptions: vec!["assumed memory".into()],
                warnings: vec![],
            })
        }
    }

    #[tokio::test]
    async fn free_text_below_confidence_threshold_is_rejected() {
        let store = InMemoryObjectStore::new();
        let doc = serde_json::json!([{ "description": "rotates videos 50x/day" }]);
        store
            .put(REGISTRY_KEY, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let oracle = StubOracle {
            confidence: 0.2,
            calls: AtomicU32::new(0),
        };
        let outcome = load_registry(&store, &oracle, &catalog(), fast_backoff())
            .await
            .unwrap();
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
    }

    #[tokio::test]
    async fn free_text_above_confidence_threshold_is_accepted() {
        let store = InMemoryObjectStore::new();
        let doc = serde_json::json!([{ "description": "rotates videos 50x/day" }]);
        store
            .put(REGISTRY_KEY, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        let oracle = StubOracle {
            confidence: 0.9,
            calls: AtomicU32::new(0),
        };
        let outcome = load_registry(&store, &oracle, &catalog(), fast_backoff())
            .await
            .unwrap();
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[tokio::test]
    async fn missing_registry_document_is_an_error() {
        let store = InMemoryObjectStore::new();
        assert!(load_registry(&store, &NullOracle, &catalog(), fast_backoff())
            .await
            .is_err());
    }
}
