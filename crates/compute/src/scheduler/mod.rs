//! Fair, preemptive-by-cooperation scheduler for computers.
//!
//! Each computer owns an [`ExecutorHandle`] which it submits whenever it has
//! work. The [`ComputerThread`] runs submitted executors one unit of work at a
//! time on a small pool of worker threads, picking whichever has had the
//! least virtual runtime, and asks long-running units to pause via their
//! [`TimeoutState`](crate::timeout::TimeoutState).

pub mod metrics;
mod queue;
pub mod runner;
pub mod task;

pub use metrics::SchedulerMetrics;
pub use runner::ComputerThread;
pub use task::{ExecutionPermit, ExecutorHandle, ExecutorState, WorkStatus, Worker};
