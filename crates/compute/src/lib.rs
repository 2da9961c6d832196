pub mod api;
pub mod computer;
pub mod context;
pub mod environment;
pub mod error;
pub mod executor;
pub mod machine;
pub mod main_thread;
pub mod scheduler;
mod sync;
pub mod timeout;

pub use api::ComputerApi;
pub use computer::Computer;
pub use context::ComputerContext;
pub use environment::{ComputerEnvironment, Environment, GlobalEnvironment, Side};
pub use error::ComputeError;
pub use executor::{ComputerExecutor, StateCommand};
pub use machine::{Machine, MachineContext, MachineError, MachineFactory, MachineResult};
pub use main_thread::{MainTask, MainThread, MainThreadExecutor, WorkMonitor};
pub use scheduler::{
    ComputerThread, ExecutionPermit, ExecutorHandle, ExecutorState, SchedulerMetrics, WorkStatus,
    Worker,
};
pub use timeout::{ABORT_MESSAGE, TimeoutState};
