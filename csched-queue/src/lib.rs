//! Delayed-task queue adapter (spec C9 / §4.8): a thin contract over a
//! persistent queue that accepts `(target_url, payload, not_before)` and
//! best-effort delivers exactly one HTTP POST at or after that time. The
//! queue itself owns delivery retry/backoff and the 4xx-drop rule; this
//! crate only owns the `enqueue` call into it.

use async_trait::async_trait;
use csched_types::DelayedTask;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone)]
pub enum QueueError {
    #[error("transient queue error: {0}")]
    Transient(String),
    #[error("permanent queue error: {0}")]
    Permanent(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

/// External collaborator contract (spec §6): `enqueue(url, payload,
/// not_before) -> task_id`.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    async fn enqueue(&self, task: &DelayedTask) -> Result<Uuid, QueueError>;
}

/// Enqueue `task` via `adapter`, retrying transient failures of the
/// enqueue call itself per spec §7 (queue calls are one of the four
/// external-error categories subject to the standard backoff policy).
pub async fn enqueue_with_retry(
    adapter: &dyn QueueAdapter,
    task: &DelayedTask,
    backoff: csched_types::BackoffPolicy,
) -> Result<Uuid, QueueError> {
    csched_types::retry_with_backoff(backoff, |e: &QueueError| e.is_retryable(), || {
        adapter.enqueue(task)
    })
    .await
}

pub mod http;
pub use http::HttpQueueAdapter;
