//! The persisted experiment record.

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::ExperimentStatus;
use crate::store::{Record, StorageError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// One persisted training attempt.
///
/// `completed_at` is set if and only if `status` is terminal.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: i64,
    pub project_id: Option<i64>,
    pub name: String,
    pub dataset_id: Option<i64>,
    /// The training configuration document as submitted.
    pub config: Value,
    pub status: ExperimentStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest value per metric name.
    pub metrics: HashMap<String, f64>,
    /// Human-readable outcome, set on terminal transitions.
    pub message: Option<String>,
}

impl Experiment {
    /// Builds an experiment from a raw store record.
    pub fn from_record(record: &Record) -> CoreResult<Self> {
        let id = get_i64(record, "id")
            .ok_or_else(|| invalid("experiment record has no id"))?;
        let name = get_str(record, "name")
            .ok_or_else(|| invalid("experiment record has no name"))?
            .to_string();
        let status = ExperimentStatus::parse(
            get_str(record, "status").ok_or_else(|| invalid("experiment record has no status"))?,
        )?;
        let started_at = get_timestamp(record, "started_at")?
            .ok_or_else(|| invalid("experiment record has no started_at"))?;

        Ok(Self {
            id,
            project_id: get_i64(record, "project_id"),
            name,
            dataset_id: get_i64(record, "dataset_id"),
            config: parse_json_column(record, "config")?.unwrap_or(Value::Null),
            status,
            started_at,
            completed_at: get_timestamp(record, "completed_at")?,
            metrics: parse_metrics_column(record)?,
            message: get_str(record, "message").map(ToString::to_string),
        })
    }
}

/// Parses the JSON-text `metrics` column; an absent column is an empty map.
pub(crate) fn parse_metrics_column(record: &Record) -> CoreResult<HashMap<String, f64>> {
    match get_str(record, "metrics") {
        None => Ok(HashMap::new()),
        Some(text) if text.trim().is_empty() => Ok(HashMap::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

fn parse_json_column(record: &Record, column: &str) -> CoreResult<Option<Value>> {
    match get_str(record, column) {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
    }
}

fn get_i64(record: &Record, column: &str) -> Option<i64> {
    record.get(column).and_then(Value::as_i64)
}

fn get_str<'a>(record: &'a Record, column: &str) -> Option<&'a str> {
    record.get(column).and_then(Value::as_str)
}

fn get_timestamp(record: &Record, column: &str) -> CoreResult<Option<DateTime<Utc>>> {
    match get_str(record, column) {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid(format!("bad {column} timestamp {text:?}: {e}"))),
    }
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::Storage(StorageError::InvalidData(message.into()))
}
