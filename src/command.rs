//! Argument-vector construction for the external trainer.

use crate::config::TrainingConfig;
use crate::error::CoreResult;
use std::path::PathBuf;

/// Default trainer executable, resolved through `PATH`.
pub const DEFAULT_TRAINER_PROGRAM: &str = "rave";

/// A fully built trainer invocation.
///
/// Immutable once built; executed directly by the process supervisor with no
/// shell interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl TrainCommand {
    /// Builds the `rave train` invocation for a validated configuration.
    pub fn build(config: &TrainingConfig) -> CoreResult<Self> {
        Self::build_with_program(DEFAULT_TRAINER_PROGRAM, config)
    }

    /// Same as [`TrainCommand::build`] with an explicit trainer executable.
    ///
    /// Argument order is deterministic: fixed flags, then user overrides in
    /// list order, then derived overrides (batch size, learning rate, step
    /// limit). The step limit comes last so it wins inside the trainer.
    pub fn build_with_program(program: &str, config: &TrainingConfig) -> CoreResult<Self> {
        config.validate()?;

        let mut args = vec![
            "train".to_string(),
            "--config".to_string(),
            config.base_config.clone(),
            "--db_path".to_string(),
            config.dataset_path.display().to_string(),
            "--name".to_string(),
            config.name.clone(),
        ];

        let mut overrides = config.overrides.clone();
        if let Some(batch_size) = config.batch_size {
            overrides.push(format!("batch_size={batch_size}"));
        }
        if let Some(lr) = config.learning_rate {
            overrides.push(format!("lr={lr}"));
        }
        if let Some(max_steps) = config.max_steps {
            overrides.push(format!("max_steps={max_steps}"));
        }
        for item in overrides {
            args.push("--override".to_string());
            args.push(item);
        }

        Ok(Self { program: program.to_string(), args, cwd: config.workdir.clone() })
    }
}
