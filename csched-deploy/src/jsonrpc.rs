use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{DeployError, DeployRequest, DeployedStatus, Deployer};

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: String,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct StatusResult {
    deployed: bool,
    url: Option<String>,
    code_hash: Option<String>,
}

#[derive(Deserialize)]
struct DeployResult {
    url: String,
    code_hash: String,
}

#[derive(Deserialize)]
struct GenerateNameResult {
    function_id: String,
}

/// JSON-RPC client for the external "function deployer" collaborator
/// (spec §6: `deploy`, `status`, `delete`, `generate_name`).
pub struct JsonRpcDeployer {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl JsonRpcDeployer {
    pub fn new(endpoint: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, DeployError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: Uuid::new_v4().to_string(),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeployError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(DeployError::Transient(format!("server error: {status}")));
        }

        let body: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| DeployError::Permanent(format!("malformed JSON-RPC response: {e}")))?;

        if let Some(err) = body.error {
            let message = format!("jsonrpc error {}: {}", err.code, err.message);
            return if err.code == -32000 {
                Err(DeployError::Transient(message))
            } else {
                Err(DeployError::Permanent(message))
            };
        }

        body.result
            .ok_or_else(|| DeployError::Permanent("missing result in JSON-RPC response".into()))
    }
}

#[async_trait]
impl Deployer for JsonRpcDeployer {
    async fn status(&self, function_id: &str, region: &str) -> Result<Option<DeployedStatus>, DeployError> {
        let result: StatusResult = self
            .call("status", json!({ "function_id": function_id, "region": region }))
            .await?;
        if !result.deployed {
            return Ok(None);
        }
        Ok(Some(DeployedStatus {
            url: result.url.unwrap_or_default(),
            code_hash: result.code_hash.unwrap_or_default(),
        }))
    }

    async fn deploy(&self, req: DeployRequest) -> Result<DeployedStatus, DeployError> {
        let result: DeployResult = self
            .call(
                "deploy",
                json!({
                    "function_id": req.function_id,
                    "region": req.region,
                    "code": req.code,
                    "requirements": req.requirements,
                    "memory_mib": req.memory_mib,
                    "timeout_ms": req.timeout_ms,
                }),
            )
            .await?;
        Ok(DeployedStatus {
            url: result.url,
            code_hash: result.code_hash,
        })
    }

    async fn delete(&self, function_id: &str, region: &str) -> Result<(), DeployError> {
        let _: serde_json::Value = self
            .call("delete", json!({ "function_id": function_id, "region": region }))
            .await?;
        Ok(())
    }

    async fn generate_name(&self, hint: &str) -> Result<String, DeployError> {
        let result: GenerateNameResult = self.call("generate_name", json!({ "hint": hint })).await?;
        Ok(result.function_id)
    }
}
