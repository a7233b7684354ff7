use async_trait::async_trait;
use csched_types::DelayedTask;
use serde::Serialize;
use uuid::Uuid;

use crate::{QueueAdapter, QueueError};

#[derive(Serialize)]
struct EnqueueRequest<'a> {
    target_url: &'a str,
    payload: &'a serde_json::Value,
    not_before_utc: chrono::DateTime<chrono::Utc>,
}

#[derive(serde::Deserialize)]
struct EnqueueResponse {
    task_id: Uuid,
}

/// HTTP client for the external persistent delayed-task queue (spec §6:
/// `enqueue(url, payload, not_before) -> id`).
pub struct HttpQueueAdapter {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpQueueAdapter {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }
}

#[async_trait]
impl QueueAdapter for HttpQueueAdapter {
    async fn enqueue(&self, task: &DelayedTask) -> Result<Uuid, QueueError> {
        let url = format!("{}/enqueue", self.base_url);
        let body = EnqueueRequest {
            target_url: &task.target_url,
            payload: &task.payload,
            not_before_utc: task.not_before_utc,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueueError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(QueueError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(QueueError::Permanent(format!("client error: {status}")));
        }

        let parsed: EnqueueResponse = resp
            .json()
            .await
            .map_err(|e| QueueError::Permanent(format!("malformed enqueue response: {e}")))?;

        Ok(parsed.task_id)
    }
}
