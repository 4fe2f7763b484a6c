use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one training run.
///
/// Every field the launcher recognizes is spelled out here; anything the
/// external tool accepts beyond these goes through `overrides`, applied in
/// list order (later overrides win inside the tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Run name, used as `--name` and as the experiment name.
    pub name: String,
    /// Owning project, if any.
    #[serde(default)]
    pub project_id: Option<i64>,
    /// Dataset record the run trains on, if tracked.
    #[serde(default)]
    pub dataset_id: Option<i64>,
    /// Path to the preprocessed dataset, used as `--db_path`.
    pub dataset_path: PathBuf,
    /// Base config name (e.g. "v2"), used as `--config`.
    #[serde(default = "default_base_config")]
    pub base_config: String,
    /// Ordered textual overrides passed through to the trainer.
    #[serde(default)]
    pub overrides: Vec<String>,
    /// Step limit; also the target for progress percentages.
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Working directory for the trainer process.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_base_config() -> String {
    "v2".to_string()
}

impl TrainingConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, dataset_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            project_id: None,
            dataset_id: None,
            dataset_path: dataset_path.into(),
            base_config: default_base_config(),
            overrides: Vec::new(),
            max_steps: None,
            batch_size: None,
            learning_rate: None,
            workdir: None,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("name is required".to_string()));
        }
        if self.dataset_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfiguration("dataset_path is required".to_string()));
        }
        if self.base_config.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("base_config is required".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(CoreError::InvalidConfiguration("batch_size must be >= 1".to_string()));
        }
        if let Some(lr) = self.learning_rate {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(CoreError::InvalidConfiguration(
                    "learning_rate must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TrainingConfig::new("run1", "/data/set");
        assert_eq!(config.base_config, "v2");
        assert!(config.overrides.is_empty());
        assert!(config.max_steps.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_requires_name() {
        let config = TrainingConfig::new("  ", "/data/set");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_requires_dataset_path() {
        let config = TrainingConfig::new("run1", "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_hyperparams() {
        let mut config = TrainingConfig::new("run1", "/data/set");
        config.batch_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::new("run1", "/data/set");
        config.learning_rate = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"name":"run1","dataset_path":"/d"}"#).unwrap();
        assert_eq!(config.base_config, "v2");
        assert!(config.project_id.is_none());
    }
}
