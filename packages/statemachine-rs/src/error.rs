//! Structured engine errors.
//!
//! `EngineError` is what the engine's own operations return. Process,
//! handler and listener closures use `anyhow` internally; their failures are
//! wrapped here with the entity they concerned so logs stay actionable.

use std::time::Duration;

use thiserror::Error;

use crate::manager::ManagerState;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A persistence call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A process, guard or not-processed callback failed for one entity.
    #[error("processing entity {entity_id} failed: {source}")]
    Process {
        entity_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A callback panicked.
    #[error("{context} panicked: {message}")]
    Panicked { context: String, message: String },

    /// A synchronous listener failed and the fan-out policy halted it.
    #[error("listener {listener} failed for entity {entity_id}: {source}")]
    Listener {
        listener: String,
        entity_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A command could not be applied.
    #[error("command {kind} for entity {entity_id} failed: {reason}")]
    Command {
        kind: &'static str,
        entity_id: String,
        reason: String,
    },

    /// A manager lifecycle call was made in the wrong state.
    #[error("manager {name} is {actual:?}, expected {expected:?}")]
    InvalidManagerState {
        name: String,
        expected: ManagerState,
        actual: ManagerState,
    },

    /// A loop whose stop timed out has not exited yet.
    #[error("manager {name} is still finishing a round from before its last stop")]
    LoopStillRunning { name: String },

    /// The processing loop did not finish within the shutdown timeout.
    #[error("manager {name} did not stop within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },

    /// Construction-time validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn process(entity_id: impl Into<String>, source: anyhow::Error) -> Self {
        EngineError::Process {
            entity_id: entity_id.into(),
            source,
        }
    }

    /// Build a [`EngineError::Panicked`] from a `catch_unwind` payload.
    pub fn from_panic(context: impl Into<String>, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        EngineError::Panicked {
            context: context.into(),
            message,
        }
    }

    /// Whether this is routine lease contention rather than a failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_contention())
    }
}
