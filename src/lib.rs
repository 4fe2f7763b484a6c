//! RAVE Studio core
//!
//! Training-process supervision and metrics extraction for the RAVE Studio
//! control panel:
//! - Building trainer invocations (`TrainCommand`)
//! - Supervising the external process (`ProcessSupervisor`)
//! - Extracting metrics from its log stream (`parser`)
//! - Driving the experiment lifecycle (`ExperimentLifecycle`)
//! - Registering and persisting runs (`ExperimentRegistry`)

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod experiment;
pub mod lifecycle;
pub mod parser;
pub mod registry;
pub mod store;
pub mod supervisor;

pub use command::{DEFAULT_TRAINER_PROGRAM, TrainCommand};
pub use config::TrainingConfig;
pub use error::{CoreError, CoreResult};
pub use events::{TrainingEvent, TrainingEventBus};
pub use experiment::Experiment;
pub use lifecycle::{ExperimentLifecycle, ExperimentStatus};
pub use parser::{extract_metrics, progress_percent};
pub use registry::ExperimentRegistry;
pub use store::{Predicate, Record, RecordStore, SqliteStore, StorageError, StorageResult};
pub use supervisor::{ProcessHandle, ProcessSupervisor, TrainingObserver};
