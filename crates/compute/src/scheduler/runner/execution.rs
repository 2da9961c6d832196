use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::ComputeError;
use crate::scheduler::queue::RunQueue;
use crate::scheduler::task::{ExecutionPermit, ExecutorHandle, WorkStatus};
use crate::sync::{lock, write};

use super::core::{RUNNING, Runner, STOPPING};
use super::ComputerThread;

impl ComputerThread {
    /// Body of a worker thread: pull executors off the queue and run them
    /// until stopped or abandoned.
    pub(super) fn run_worker(self: Arc<Self>, runner: Arc<Runner>) {
        trace!(worker = runner.index, "Worker started.");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while runner.running.load(Ordering::Acquire) {
                let Some(handle) = self.next_executor(&runner) else {
                    break;
                };
                self.execute(&runner, handle);
            }
        }));
        if let Err(payload) = outcome {
            error!(
                "Worker {} crashed: {}",
                runner.index,
                ComputeError::from_panic(payload)
            );
        }

        self.worker_finished(&runner);
    }

    /// Block until an executor is ready. Returns `None` once stopping with an
    /// empty queue.
    fn next_executor(&self, runner: &Runner) -> Option<Arc<ExecutorHandle>> {
        let mut queue = lock(&self.queue);
        self.idle_workers.fetch_add(1, Ordering::AcqRel);
        let next = loop {
            if let Some(handle) = queue.pop_first() {
                self.pending.store(queue.len(), Ordering::Release);
                break Some(handle);
            }
            if self.state() >= STOPPING || !runner.running.load(Ordering::Acquire) {
                break None;
            }
            queue = self
                .work_available
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        };
        self.idle_workers.fetch_sub(1, Ordering::AcqRel);
        next
    }

    fn execute(&self, runner: &Runner, handle: Arc<ExecutorHandle>) {
        // The computer was dropped while queued; nothing left to run.
        let Some(worker) = handle.worker() else {
            return;
        };
        let computer = worker.computer_id();

        if !handle.begin_run() {
            error!(
                "Computer #{} was dispatched on {} without being queued. This is a SERIOUS bug, please report.",
                computer,
                runner.name()
            );
        }

        let Some(permit) = ExecutionPermit::acquire(&handle, runner.token) else {
            error!(
                "Trying to run computer #{} on {}, but already running on another thread. This is a SERIOUS bug, please report.",
                computer,
                runner.name()
            );
            return;
        };

        // While stopping, the only thing a computer should do is shut down.
        if self.state() >= STOPPING {
            worker.unload();
        }

        handle.set_vruntime_start(self.now_nanos());
        handle.timeout().start_timer(self.scaled_period());
        // Only publish to the monitor once the timer is running.
        runner.set_current(Arc::clone(&handle));

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| worker.work(&permit)))
            .unwrap_or_else(|payload| Err(ComputeError::from_panic(payload)));

        let interrupted = matches!(result, Ok(WorkStatus::Interrupted));
        match result {
            Ok(WorkStatus::Done) => {}
            Ok(WorkStatus::MoreWork | WorkStatus::Interrupted) => {
                if let Err(e) = handle.submit() {
                    debug!(computer, "Could not requeue computer: {}", e);
                }
            }
            Err(e) => {
                error!(computer, "Error running task on computer #{}: {}", computer, e);
                // No guarantee the computer is well-behaved from here on.
                worker.abort_with_error();
            }
        }
        drop(permit);

        self.record_execution(computer, started.elapsed());

        // The monitor may already have detached us.
        if let Some(current) = runner.take_current() {
            self.after_work(&current, interrupted);
        }
    }

    /// Settle an executor after a unit of work, requeueing it if more was
    /// submitted meanwhile.
    ///
    /// The cumulative clock only carries over when the machine was
    /// `interrupted` mid-event. Anything else starts the next run afresh.
    pub(super) fn after_work(&self, handle: &Arc<ExecutorHandle>, interrupted: bool) {
        if interrupted {
            handle.timeout().pause_timer();
        } else {
            handle.timeout().stop_timer();
        }

        let mut queue = lock(&self.queue);
        self.update_runtimes(&mut queue, Some(handle));

        // Keep requeueing while stopping, so pending shutdowns still run.
        if !handle.finish_run() || self.state() > STOPPING {
            return;
        }

        queue.insert(Arc::clone(handle));
        self.pending.store(queue.len(), Ordering::Release);
        self.work_available.notify_one();
    }

    /// Charge every running executor (and `current`, if it has just stopped
    /// running) for the time since it was last charged, then raise the
    /// minimum runtime to match.
    pub(super) fn update_runtimes(&self, queue: &mut RunQueue, current: Option<&ExecutorHandle>) {
        let mut minimum = queue.first_runtime().unwrap_or(u64::MAX);

        let now = self.now_nanos();
        let tasks = 1 + queue.len() as u64;
        for runner in self.runner_snapshot() {
            if let Some(handle) = runner.current() {
                minimum = minimum.min(handle.charge(now, tasks));
            }
        }

        if let Some(handle) = current {
            minimum = minimum.min(handle.charge(now, tasks));
        }

        if minimum > queue.minimum_runtime && minimum < u64::MAX {
            queue.minimum_runtime = minimum;
        }
    }

    /// Retire a runner, replacing it if the scheduler still needs workers.
    /// Returns false if it had already been retired.
    pub(super) fn worker_finished(&self, runner: &Arc<Runner>) -> bool {
        // Only once: a worker abandoned by the monitor may still exit normally later.
        if !runner.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        trace!("Worker {} finished.", runner.index);

        // Whatever the abandoned thread was doing is being torn down, so the
        // next run must not inherit its overrun.
        if let Some(handle) = runner.take_current() {
            handle.revoke_permit();
            self.after_work(&handle, false);
        }

        let mut slots = lock(&self.runners);
        slots.count = slots.count.saturating_sub(1);

        let is_occupant = matches!(&slots.workers[runner.index], Some(r) if Arc::ptr_eq(r, runner));
        if !is_occupant {
            error!("Worker {} closed, but new runner has been spawned.", runner.index);
        } else if self.state() == RUNNING || (self.state() == STOPPING && self.has_pending_work()) {
            if let Err(e) = self.spawn_worker(&mut slots, runner.index) {
                error!("Failed to replace worker {}: {}", runner.index, e);
                slots.workers[runner.index] = None;
            }
        } else {
            slots.workers[runner.index] = None;
        }
        drop(slots);

        self.workers_exited.notify_all();
        true
    }

    fn record_execution(&self, computer: u32, duration: Duration) {
        write(&self.metrics).record_execution(computer, duration);
    }
}
