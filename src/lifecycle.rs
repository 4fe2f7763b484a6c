//! Experiment status state machine.
//!
//! `running` is the only initial state; `completed`, `failed`, and `stopped`
//! are terminal. A terminal transition persists the new status, the
//! completion timestamp, and the outcome message together, in a single
//! record update.

use crate::error::{CoreError, CoreResult};
use crate::store::{Predicate, Record, RecordStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tracing::info;

pub const EXPERIMENTS_TABLE: &str = "experiments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(CoreError::InvalidTransition(format!("unknown status: {other:?}"))),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives persisted status transitions for experiments.
///
/// Check-and-write is serialized by an internal mutex, so a stop request
/// racing a natural process exit cannot overwrite an already-terminal state.
#[derive(Clone)]
pub struct ExperimentLifecycle {
    store: Arc<dyn RecordStore>,
    gate: Arc<Mutex<()>>,
}

impl ExperimentLifecycle {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, gate: Arc::new(Mutex::new(())) }
    }

    /// Transitions an experiment into the given terminal status.
    ///
    /// Status, completion timestamp, and outcome message are written in one
    /// atomic record update. Returns `UnknownExperiment` for an id the store
    /// does not know, `AlreadyTerminal` when the experiment has already
    /// finished; both leave the record untouched.
    pub fn finish(
        &self,
        experiment_id: i64,
        outcome: ExperimentStatus,
        message: &str,
    ) -> CoreResult<()> {
        if !outcome.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "cannot transition into non-terminal status {outcome}"
            )));
        }

        let _gate = self.gate.lock().unwrap();

        let record = self
            .store
            .fetch_one(EXPERIMENTS_TABLE, &Predicate::by_id(experiment_id))?
            .ok_or(CoreError::UnknownExperiment(experiment_id))?;
        let current = ExperimentStatus::parse(
            record.get("status").and_then(Value::as_str).unwrap_or_default(),
        )?;
        if current.is_terminal() {
            return Err(CoreError::AlreadyTerminal(experiment_id));
        }

        let mut fields = Record::new();
        fields.insert("status".to_string(), json!(outcome.as_str()));
        fields.insert("completed_at".to_string(), json!(Utc::now().to_rfc3339()));
        fields.insert("message".to_string(), json!(message));
        self.store.update(EXPERIMENTS_TABLE, experiment_id, &fields)?;

        info!(experiment_id, status = %outcome, message, "experiment transitioned");
        Ok(())
    }
}
