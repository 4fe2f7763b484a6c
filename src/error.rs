use crate::store::StorageError;
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid training configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown experiment: {0}")]
    UnknownExperiment(i64),

    #[error("experiment {0} is already in a terminal state")]
    AlreadyTerminal(i64),

    #[error("invalid lifecycle transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
