use cc_core::CoreError;

use crate::machine::MachineError;

/// Errors surfaced by the scheduling core.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Computer thread is no longer running")]
    SchedulerStopped,

    #[error("Failed to spawn {0}")]
    Spawn(String),

    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ComputeError {
    /// Build a [`ComputeError::WorkerPanicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ComputeError::WorkerPanicked(message)
    }
}
