//! Metadata normalizer (spec C3): free-text function descriptions go
//! through the LLM oracle, which returns a structured record, a confidence
//! score, and supporting assumption/warning lists.

use async_trait::async_trait;
use csched_types::FunctionMetadata;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transient oracle error: {0}")]
    Transient(String),
    #[error("permanent extraction failure: {0}")]
    Permanent(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Transient(_))
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct OracleExtraction {
    pub record: FunctionMetadata,
    pub confidence: f64,
    pub assumptions: Vec<String>,
    pub warnings: Vec<String>,
}

/// Confidence below this rejects the function for this cycle (spec §4.2).
pub const MIN_CONFIDENCE: f64 = 0.5;

/// Any implementation that turns a free-text function description into a
/// structured record. Production deployments point this at the external
/// LLM oracle; tests and local runs can supply a fixed-answer stub.
#[async_trait]
pub trait NormalizationOracle: Send + Sync {
    async fn extract(
        &self,
        description: &str,
        catalog_regions: &[String],
    ) -> Result<OracleExtraction, OracleError>;
}

/// Oracle stub that always fails permanently: a safe default that makes the
/// absence of a real oracle explicit rather than silently no-op-succeeding.
pub struct NullOracle;

#[async_trait]
impl NormalizationOracle for NullOracle {
    async fn extract(
        &self,
        _description: &str,
        _catalog_regions: &[String],
    ) -> Result<OracleExtraction, OracleError> {
        Err(OracleError::Permanent("no oracle configured".into()))
    }
}

#[derive(serde::Serialize)]
struct ExtractRequest<'a> {
    description: &'a str,
    catalog_regions: &'a [String],
}

/// HTTP client for the external LLM oracle's free-text extraction contract
/// (spec §6: "accepts a prompt+schema, returns JSON obeying the schema").
pub struct HttpNormalizationOracle {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpNormalizationOracle {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }
}

#[async_trait]
impl NormalizationOracle for HttpNormalizationOracle {
    async fn extract(
        &self,
        description: &str,
        catalog_regions: &[String],
    ) -> Result<OracleExtraction, OracleError> {
        let url = format!("{}/extract", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&ExtractRequest {
                description,
                catalog_regions,
            })
            .send()
            .await
            .map_err(|e| OracleError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(OracleError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(OracleError::Permanent(format!("client error: {status}")));
        }

        resp.json::<OracleExtraction>()
            .await
            .map_err(|e| OracleError::Permanent(format!("malformed oracle response: {e}")))
    }
}
