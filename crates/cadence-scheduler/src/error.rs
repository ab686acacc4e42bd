use thiserror::Error;

use crate::worker::WorkerState;

/// Errors that can occur within the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Trigger construction or resolution failed.
    #[error(transparent)]
    Trigger(#[from] cadence_core::error::TriggerError),

    /// The lifecycle operation is not legal in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkerState,
    },

    /// A handler with an empty name cannot be bound.
    #[error("Handler name is empty")]
    EmptyHandlerName,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
