use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tracing::error;

use super::runner::ComputerThread;
use crate::error::ComputeError;
use crate::timeout::TimeoutState;

/// What a worker wants after one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Nothing left to do until something new is submitted.
    Done,
    /// More work is already pending; run again.
    MoreWork,
    /// Yielded part way through an event. Run again, continuing its timer.
    Interrupted,
}

/// Something the [`ComputerThread`] can run, one unit at a time.
///
/// Implemented by the computer executor. Every method other than
/// [`Worker::work`] may be called from any thread at any time.
pub trait Worker: Send + Sync {
    /// Perform one unit of work. Only ever called by the holder of `permit`.
    fn work(&self, permit: &ExecutionPermit<'_>) -> Result<WorkStatus, ComputeError>;

    fn computer_id(&self) -> u32;

    /// Describe internal state for timeout reports.
    fn write_state(&self, out: &mut String);

    /// Destroy the running machine immediately and schedule a timeout shutdown.
    fn abort_with_timeout(&self);

    /// Destroy the running machine immediately and schedule an error shutdown.
    fn abort_with_error(&self);

    /// Shut down and refuse any further work.
    fn unload(&self);
}

/// Queue membership of an executor.
///
/// ```text
///            submit()            after_work()
///      Idle ---------> OnQueue <------------ Repeat
///       ^                 |                    ^
///       |                 | dispatch           |
///       |                 v                    |
///       +--------------Running-----------------+
///   after_work()                  submit()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    Idle = 0,
    OnQueue = 1,
    Running = 2,
    Repeat = 3,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutorState::Idle,
            1 => ExecutorState::OnQueue,
            2 => ExecutorState::Running,
            _ => ExecutorState::Repeat,
        }
    }

    pub fn enqueue(self) -> Self {
        match self {
            ExecutorState::Idle | ExecutorState::OnQueue => ExecutorState::OnQueue,
            ExecutorState::Running | ExecutorState::Repeat => ExecutorState::Repeat,
        }
    }

    pub fn requeue(self) -> Self {
        match self {
            ExecutorState::Idle | ExecutorState::OnQueue => {
                error!("Impossible state - calling requeue with {:?}.", self);
                ExecutorState::OnQueue
            }
            ExecutorState::Running => ExecutorState::Idle,
            ExecutorState::Repeat => ExecutorState::OnQueue,
        }
    }
}

/// The scheduler's view of one worker: queue state, virtual runtime,
/// timeout clock and execution claim.
pub struct ExecutorHandle {
    id: u64,
    worker: Weak<dyn Worker>,
    scheduler: Weak<ComputerThread>,
    timeout: Arc<TimeoutState>,
    state: AtomicU8,
    /// Token of the worker thread holding the [`ExecutionPermit`], or 0.
    owner: AtomicU64,
    /// Written under the scheduler's queue lock.
    virtual_runtime: AtomicU64,
    /// Scheduler-relative nanos at which `virtual_runtime` was last charged.
    vruntime_start: AtomicU64,
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("virtual_runtime", &self.virtual_runtime())
            .finish()
    }
}

impl ExecutorHandle {
    pub(super) fn new(
        id: u64,
        worker: Weak<dyn Worker>,
        scheduler: Weak<ComputerThread>,
        timeout: Arc<TimeoutState>,
    ) -> Self {
        Self {
            id,
            worker,
            scheduler,
            timeout,
            state: AtomicU8::new(ExecutorState::Idle as u8),
            owner: AtomicU64::new(0),
            virtual_runtime: AtomicU64::new(0),
            vruntime_start: AtomicU64::new(0),
        }
    }

    /// Mark the worker as having work, queueing it if it is idle.
    ///
    /// Calling this while already queued does nothing; calling it while
    /// running defers the requeue until the current unit finishes.
    pub fn submit(self: &Arc<Self>) -> Result<(), ComputeError> {
        let previous = self.update_state(ExecutorState::enqueue);
        if previous != ExecutorState::Idle {
            return Ok(());
        }

        let result = match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.queue(Arc::clone(self)),
            None => Err(ComputeError::SchedulerStopped),
        };
        if result.is_err() {
            self.state.store(ExecutorState::Idle as u8, Ordering::Release);
        }
        result
    }

    pub fn timeout(&self) -> &Arc<TimeoutState> {
        &self.timeout
    }

    pub fn virtual_runtime(&self) -> u64 {
        self.virtual_runtime.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn worker(&self) -> Option<Arc<dyn Worker>> {
        self.worker.upgrade()
    }

    pub(super) fn set_virtual_runtime(&self, value: u64) {
        self.virtual_runtime.store(value, Ordering::Release);
    }

    pub(super) fn set_vruntime_start(&self, now: u64) {
        self.vruntime_start.store(now, Ordering::Release);
    }

    /// Charge the time since the last charge, shared between `tasks` runnable
    /// executors. Returns the new virtual runtime.
    pub(super) fn charge(&self, now: u64, tasks: u64) -> u64 {
        let start = self.vruntime_start.swap(now, Ordering::AcqRel);
        let delta = now.saturating_sub(start) / tasks.max(1);
        self.virtual_runtime.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Mark the executor as running as a worker picks it up. Returns false if
    /// it was not on the queue beforehand.
    pub(super) fn begin_run(&self) -> bool {
        let previous = self.state.swap(ExecutorState::Running as u8, Ordering::AcqRel);
        previous == ExecutorState::OnQueue as u8
    }

    /// Leave the running state. Returns whether the executor should be requeued.
    pub(super) fn finish_run(&self) -> bool {
        self.update_state(ExecutorState::requeue) == ExecutorState::Repeat
    }

    /// Drop whatever claim is held, so a replacement worker may take over.
    pub(super) fn revoke_permit(&self) {
        self.owner.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(super) fn is_claimed(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    fn update_state(&self, f: impl Fn(ExecutorState) -> ExecutorState) -> ExecutorState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(f(ExecutorState::from_u8(s)) as u8)
            })
            .unwrap_or_else(|s| s);
        ExecutorState::from_u8(previous)
    }
}

/// Proof that the current thread holds the exclusive right to run an
/// executor. Released when dropped.
#[derive(Debug)]
pub struct ExecutionPermit<'a> {
    handle: &'a ExecutorHandle,
    token: u64,
}

impl<'a> ExecutionPermit<'a> {
    /// Claim `handle` for the thread identified by `token`. Fails if it is
    /// already claimed.
    pub(super) fn acquire(handle: &'a ExecutorHandle, token: u64) -> Option<Self> {
        debug_assert_ne!(token, 0);
        handle
            .owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { handle, token })
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Whether this permit was issued for `handle`.
    pub fn is_for(&self, handle: &ExecutorHandle) -> bool {
        std::ptr::eq(self.handle, handle)
    }
}

impl Drop for ExecutionPermit<'_> {
    fn drop(&mut self) {
        // Fails harmlessly if the monitor has revoked the claim.
        let _ = self.handle.owner.compare_exchange(
            self.token,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
