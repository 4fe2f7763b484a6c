//! Experiment registry: the public entry point for starting, stopping, and
//! inspecting training runs.

use crate::command::{DEFAULT_TRAINER_PROGRAM, TrainCommand};
use crate::config::TrainingConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{TrainingEvent, TrainingEventBus};
use crate::experiment::{Experiment, parse_metrics_column};
use crate::lifecycle::{EXPERIMENTS_TABLE, ExperimentLifecycle, ExperimentStatus};
use crate::store::{Predicate, Record, RecordStore};
use crate::supervisor::{ProcessHandle, ProcessSupervisor, TrainingObserver};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Owns the active process handles and wires supervisor callbacks to the
/// persisted experiment records and the event bus.
///
/// At most one handle exists per experiment id; a handle is removed
/// immediately after the terminal status write it belongs to.
pub struct ExperimentRegistry {
    store: Arc<dyn RecordStore>,
    lifecycle: ExperimentLifecycle,
    events: Arc<TrainingEventBus>,
    active: Arc<Mutex<HashMap<i64, ProcessHandle>>>,
    trainer_program: String,
}

impl ExperimentRegistry {
    /// Creates a registry that launches the default `rave` executable.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_program(store, DEFAULT_TRAINER_PROGRAM)
    }

    /// Creates a registry with an explicit trainer executable.
    #[must_use]
    pub fn with_program(store: Arc<dyn RecordStore>, trainer_program: impl Into<String>) -> Self {
        Self {
            lifecycle: ExperimentLifecycle::new(Arc::clone(&store)),
            store,
            events: Arc::new(TrainingEventBus::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            trainer_program: trainer_program.into(),
        }
    }

    /// Validates the configuration, persists a `running` experiment record,
    /// launches the trainer, and returns the new experiment id.
    ///
    /// Only configuration errors are returned synchronously; launch failures
    /// surface through the `Finished` event and a `failed` status. Must be
    /// called from within a tokio runtime.
    pub fn start_training(&self, config: &TrainingConfig) -> CoreResult<i64> {
        let command = TrainCommand::build_with_program(&self.trainer_program, config)?;

        let mut fields = Record::new();
        fields.insert("project_id".to_string(), json!(config.project_id));
        fields.insert("name".to_string(), json!(config.name));
        fields.insert("dataset_id".to_string(), json!(config.dataset_id));
        fields.insert("config".to_string(), json!(serde_json::to_string(config)?));
        fields.insert("status".to_string(), json!(ExperimentStatus::Running.as_str()));
        fields.insert("started_at".to_string(), json!(Utc::now().to_rfc3339()));
        fields.insert("metrics".to_string(), json!("{}"));
        let experiment_id = self.store.insert(EXPERIMENTS_TABLE, &fields)?;

        // Registered before launch so no event can precede the channel.
        self.events.register(experiment_id);

        let observer = Arc::new(RegistryObserver {
            experiment_id,
            store: Arc::clone(&self.store),
            lifecycle: self.lifecycle.clone(),
            events: Arc::clone(&self.events),
            active: Arc::clone(&self.active),
        });

        // Insert under the same lock section as the launch so a process that
        // exits instantly cannot observe a registry without its handle.
        {
            let mut active = self.active.lock().unwrap();
            let handle = ProcessSupervisor::start(
                command,
                config.max_steps,
                observer as Arc<dyn TrainingObserver>,
            );
            active.insert(experiment_id, handle);
        }

        info!(experiment_id, name = %config.name, "training started");
        Ok(experiment_id)
    }

    /// Stops a running experiment.
    ///
    /// Returns `true` when an active handle existed: the process is killed,
    /// the experiment transitions to `stopped`, and the handle is dropped.
    /// Returns `false` for unknown ids or already-finished experiments.
    pub fn stop_training(&self, experiment_id: i64) -> bool {
        let handle = { self.active.lock().unwrap().remove(&experiment_id) };
        let Some(handle) = handle else {
            debug!(experiment_id, "stop requested for inactive experiment");
            return false;
        };

        handle.stop();
        match self.lifecycle.finish(experiment_id, ExperimentStatus::Stopped, "stopped by user") {
            Ok(()) => {}
            // The process finished on its own between the map removal and
            // the transition; its own terminal state stands.
            Err(CoreError::AlreadyTerminal(_)) => {
                debug!(experiment_id, "experiment finished before stop transition");
            }
            Err(e) => warn!(experiment_id, error = %e, "failed to persist stop transition"),
        }
        info!(experiment_id, "training stopped");
        true
    }

    /// Latest persisted metrics snapshot; empty if none recorded yet.
    pub fn get_metrics(&self, experiment_id: i64) -> CoreResult<HashMap<String, f64>> {
        let record = self
            .store
            .fetch_one(EXPERIMENTS_TABLE, &Predicate::by_id(experiment_id))?
            .ok_or(CoreError::UnknownExperiment(experiment_id))?;
        parse_metrics_column(&record)
    }

    /// Fetches one experiment record.
    pub fn get_experiment(&self, experiment_id: i64) -> CoreResult<Option<Experiment>> {
        self.store
            .fetch_one(EXPERIMENTS_TABLE, &Predicate::by_id(experiment_id))?
            .map(|record| Experiment::from_record(&record))
            .transpose()
    }

    /// Lists experiments, optionally filtered by owning project.
    pub fn list_experiments(&self, project_id: Option<i64>) -> CoreResult<Vec<Experiment>> {
        let predicate = match project_id {
            Some(project_id) => Predicate::all().eq("project_id", json!(project_id)),
            None => Predicate::all(),
        };
        self.store
            .fetch_all(EXPERIMENTS_TABLE, &predicate)?
            .iter()
            .map(Experiment::from_record)
            .collect()
    }

    /// Subscribes to the event stream of one experiment.
    ///
    /// The first subscriber sees every event since the run started; later
    /// subscribers join live. For unknown ids or experiments that already
    /// emitted `Finished`, the receiver reports the stream as closed.
    pub fn subscribe(&self, experiment_id: i64) -> broadcast::Receiver<TrainingEvent> {
        self.events.subscribe(experiment_id)
    }

    /// Whether the registry currently holds a live handle for the id.
    #[must_use]
    pub fn is_active(&self, experiment_id: i64) -> bool {
        self.active.lock().unwrap().contains_key(&experiment_id)
    }
}

/// Bridges supervisor callbacks to persistence and the event bus for one
/// experiment. Runs entirely on the process's reader task.
struct RegistryObserver {
    experiment_id: i64,
    store: Arc<dyn RecordStore>,
    lifecycle: ExperimentLifecycle,
    events: Arc<TrainingEventBus>,
    active: Arc<Mutex<HashMap<i64, ProcessHandle>>>,
}

impl TrainingObserver for RegistryObserver {
    fn on_line(&self, line: &str) {
        self.events.publish(TrainingEvent::Line {
            experiment_id: self.experiment_id,
            line: line.to_string(),
        });
    }

    fn on_metrics(&self, metrics: &HashMap<String, f64>) {
        let serialized = match serde_json::to_string(metrics) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(experiment_id = self.experiment_id, error = %e, "unserializable metrics");
                return;
            }
        };
        let mut fields = Record::new();
        fields.insert("metrics".to_string(), json!(serialized));
        if let Err(e) = self.store.update(EXPERIMENTS_TABLE, self.experiment_id, &fields) {
            // A failed snapshot write must not abort the training run.
            warn!(experiment_id = self.experiment_id, error = %e, "failed to persist metrics");
        }
        self.events.publish(TrainingEvent::Metrics {
            experiment_id: self.experiment_id,
            metrics: metrics.clone(),
        });
    }

    fn on_progress(&self, percent: u8, message: &str) {
        self.events.publish(TrainingEvent::Progress {
            experiment_id: self.experiment_id,
            percent,
            message: message.to_string(),
        });
    }

    fn on_finished(&self, success: bool, message: &str) {
        let outcome =
            if success { ExperimentStatus::Completed } else { ExperimentStatus::Failed };
        match self.lifecycle.finish(self.experiment_id, outcome, message) {
            Ok(()) => {}
            // Already stopped through the registry; that state stands.
            Err(CoreError::AlreadyTerminal(_)) => {
                debug!(experiment_id = self.experiment_id, "terminal state already persisted");
            }
            Err(e) => {
                warn!(experiment_id = self.experiment_id, error = %e, "failed to persist outcome");
            }
        }
        // Remove the handle right after the terminal write, then announce.
        self.active.lock().unwrap().remove(&self.experiment_id);
        self.events.publish(TrainingEvent::Finished {
            experiment_id: self.experiment_id,
            success,
            message: message.to_string(),
        });
        self.events.remove(self.experiment_id);
    }
}
