use statemachine::{EngineError, StoreError};
use thiserror::Error;

/// Errors surfaced by the connector's domain managers.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("cannot delete {entity} {id}: {reason}")]
    DeletionRefused {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("command {kind} for {id} not accepted: {reason}")]
    CommandNotAccepted {
        kind: &'static str,
        id: String,
        reason: &'static str,
    },
}

impl From<StoreError> for ConnectorError {
    fn from(e: StoreError) -> Self {
        ConnectorError::Engine(EngineError::Store(e))
    }
}
