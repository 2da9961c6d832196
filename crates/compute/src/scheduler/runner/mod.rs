//! Worker pool and monitor behind [`ComputerThread`].
//!
//! - `core`: the scheduler struct, queueing, thread spawning and shutdown
//! - `execution`: the worker loop, runtime accounting and worker replacement
//! - `monitor`: timeout enforcement for running executors

mod core;
mod execution;
mod monitor;

pub use self::core::ComputerThread;
