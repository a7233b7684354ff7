//! Structured telemetry (spec C13): one event per invocation and per
//! planner-cycle state transition, append-only and hash-chained so an
//! operator can verify nothing in the log was rewritten after the fact.
//!
//! A chain hash per line, an `append` that's the only writer, and a
//! standalone `verify` that replays the chain.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("chain hash mismatch at line {0}")]
    ChainMismatch(usize),
}

/// One planner-cycle or dispatch outcome, per spec §4.5/§7/§8.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CachedHit,
    Scored,
    Ranked,
    Written,
    Failed,
    FailedTimeout,
    DeployFailed,
    Dispatched,
    Deferred,
    Retry,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Free-form scenario/cycle tag, e.g. a planning-cycle id.
    pub scenario: String,
    pub function_id: Option<String>,
    pub region: Option<String>,
    pub hour_start_utc: Option<DateTime<Utc>>,
    pub forecast_value_g_per_kwh: Option<f64>,
    pub carbon_attributed_g: Option<f64>,
    pub cost_attributed_usd: Option<f64>,
    pub detail: Option<String>,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

pub struct TelemetryLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl TelemetryLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn append(&self, mut event: TelemetryEvent) -> Result<(), TelemetryError> {
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| TelemetryError::Io("poisoned lock".into()))?;
        event.prev_hash = last.clone();
        event.chain_hash = hash_event(&event);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TelemetryError::Io(e.to_string()))?;
        let line =
            serde_json::to_string(&event).map_err(|e| TelemetryError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| TelemetryError::Io(e.to_string()))?;
        *last = Some(event.chain_hash.clone());
        tracing::info!(kind = ?event.kind, function_id = ?event.function_id, "telemetry event");
        Ok(())
    }

    /// Return the last `n` events, most recent last.
    pub fn tail(&self, n: usize) -> Result<Vec<TelemetryEvent>, TelemetryError> {
        let all = read_all(&self.path)?;
        let start = all.len().saturating_sub(n);
        Ok(all[start..].to_vec())
    }
}

/// Replay the whole chain and confirm every `chain_hash` matches its
/// content and every `prev_hash` matches the previous line's chain hash.
pub fn verify(path: impl AsRef<Path>) -> Result<(), TelemetryError> {
    let events = read_all(path.as_ref())?;
    let mut prev: Option<String> = None;
    for (idx, event) in events.iter().enumerate() {
        if event.prev_hash != prev {
            return Err(TelemetryError::ChainMismatch(idx));
        }
        let expected = hash_event(event);
        if event.chain_hash != expected {
            return Err(TelemetryError::ChainMismatch(idx));
        }
        prev = Some(event.chain_hash.clone());
    }
    Ok(())
}

fn hash_event(event: &TelemetryEvent) -> String {
    let mut h = Sha256::new();
    h.update(event.event_id.as_bytes());
    h.update(event.timestamp.to_rfc3339().as_bytes());
    h.update(format!("{:?}", event.kind).as_bytes());
    h.update(event.scenario.as_bytes());
    if let Some(f) = &event.function_id {
        h.update(f.as_bytes());
    }
    if let Some(r) = &event.region {
        h.update(r.as_bytes());
    }
    if let Some(prev) = &event.prev_hash {
        h.update(prev.as_bytes());
    }
    hex::encode(h.finalize())
}

fn read_all(path: &Path) -> Result<Vec<TelemetryEvent>, TelemetryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| TelemetryError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| TelemetryError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: TelemetryEvent =
            serde_json::from_str(&line).map_err(|e| TelemetryError::Parse(e.to_string()))?;
        out.push(event);
    }
    Ok(out)
}

fn read_last_hash(path: &Path) -> Result<Option<String>, TelemetryError> {
    Ok(read_all(path)?.last().map(|e| e.chain_hash.clone()))
}

/// Convenience builder so call sites don't repeat the full struct literal
/// for every field they don't care about.
pub struct EventBuilder {
    event: TelemetryEvent,
}

impl EventBuilder {
    pub fn new(scenario: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event: TelemetryEvent {
                event_id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                kind,
                scenario: scenario.into(),
                function_id: None,
                region: None,
                hour_start_utc: None,
                forecast_value_g_per_kwh: None,
                carbon_attributed_g: None,
                cost_attributed_usd: None,
                detail: None,
                prev_hash: None,
                chain_hash: String::new(),
            },
        }
    }

    pub fn function_id(mut self, id: impl Into<String>) -> Self {
        self.event.function_id = Some(id.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.event.region = Some(region.into());
        self
    }

    pub fn hour_start(mut self, ts: DateTime<Utc>) -> Self {
        self.event.hour_start_utc = Some(ts);
        self
    }

    pub fn forecast_value(mut self, v: f64) -> Self {
        self.event.forecast_value_g_per_kwh = Some(v);
        self
    }

    pub fn carbon_attributed(mut self, g: f64) -> Self {
        self.event.carbon_attributed_g = Some(g);
        self
    }

    pub fn cost_attributed(mut self, usd: f64) -> Self {
        self.event.cost_attributed_usd = Some(usd);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.event.detail = Some(detail.into());
        self
    }

    pub fn build(self) -> TelemetryEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_across_appends() {
        let path = std::env::temp_dir().join(format!("csched_telemetry_test_{}.jsonl", uuid::Uuid::new_v4()));
        let _ = std::fs::remove_file(&path);
        let log = TelemetryLog::open(&path).unwrap();
        log.append(EventBuilder::new("cycle-1", EventKind::Written).function_id("fn-a").build())
            .unwrap();
        log.append(EventBuilder::new("cycle-1", EventKind::CachedHit).function_id("fn-b").build())
            .unwrap();
        verify(&path).unwrap();
        let tail = log.tail(1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].function_id.as_deref(), Some("fn-b"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tampered_line_fails_verification() {
        let path = std::env::temp_dir().join(format!("csched_telemetry_tamper_{}.jsonl", uuid::Uuid::new_v4()));
        let _ = std::fs::remove_file(&path);
        let log = TelemetryLog::open(&path).unwrap();
        log.append(EventBuilder::new("cycle-1", EventKind::Written).build())
            .unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content = content.replace("cycle-1", "cycle-9");
        std::fs::write(&path, content).unwrap();
        assert!(verify(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
