//! Delayed-task queue entry (spec §3 `DelayedTask`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::TypesError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DelayedTask {
    pub task_id: Uuid,
    pub target_url: String,
    pub payload: serde_json::Value,
    pub not_before_utc: DateTime<Utc>,
}

impl DelayedTask {
    pub fn new(
        target_url: String,
        payload: serde_json::Value,
        not_before_utc: DateTime<Utc>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self, TypesError> {
        if not_before_utc < enqueued_at {
            return Err(TypesError::Invariant(
                "not_before must be >= enqueue time".into(),
            ));
        }
        Ok(Self {
            task_id: Uuid::new_v4(),
            target_url,
            payload,
            not_before_utc,
        })
    }
}
