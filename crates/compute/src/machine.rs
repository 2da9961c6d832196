//! The seam between the scheduler and the script machine it drives.
//!
//! Machines are opaque resumable computations. The scheduler never looks
//! inside one: it resumes it with an event (or with nothing, to continue a
//! paused call) and acts on the three-way [`MachineResult`].

use std::sync::Arc;

use cc_core::Event;

use crate::timeout::TimeoutState;

/// Outcome of a single resumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineResult {
    /// The event was fully handled.
    Completed,
    /// The machine yielded mid-event and must be resumed before the next one.
    Paused,
    /// The machine failed; the message is shown on the terminal.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MachineError(pub String);

/// Everything a machine needs to know about the computer it runs on.
#[derive(Debug, Clone)]
pub struct MachineContext {
    pub computer_id: u32,
    pub timeout: Arc<TimeoutState>,
    pub host: String,
    /// Names of the APIs installed on the computer.
    pub apis: Vec<String>,
}

pub trait Machine: Send + Sync {
    /// Load and prepare the boot program.
    fn load_boot(&self, bios: &[u8]) -> Result<(), MachineError>;

    /// Resume with `event`, or continue the paused call when `None`.
    fn resume(&self, event: Option<&Event>) -> MachineResult;

    /// Destroy the machine. Must be idempotent, and safe to call from another
    /// thread while [`Machine::resume`] is in progress.
    fn close(&self);

    /// Append debugging information used in timeout reports.
    fn write_state(&self, _out: &mut String) {}
}

pub trait MachineFactory: Send + Sync {
    fn create(&self, context: MachineContext) -> Result<Arc<dyn Machine>, MachineError>;
}
