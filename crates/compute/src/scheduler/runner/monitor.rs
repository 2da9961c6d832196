use std::fmt::Write as _;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::scheduler::task::ExecutorHandle;
use crate::sync::{lock, write};

use super::core::{CLOSED, Runner};
use super::ComputerThread;

/// Minimum gap between two timeout reports for the same worker.
const REPORT_DEBOUNCE: Duration = Duration::from_secs(1);

impl ComputerThread {
    /// Body of the monitor thread.
    pub(super) fn run_monitor(self: Arc<Self>) {
        trace!("Monitor starting.");

        while self.state() < CLOSED {
            {
                let queue = lock(&self.queue);
                // With more work than workers someone will need pausing soon, so
                // check every period. Otherwise we only need to set abort flags,
                // which are far less granular.
                let wait = if self.is_busy_with(queue.len()) {
                    self.scaled_period_for(queue.len())
                } else {
                    self.monitor_wakeup
                };
                let _ = self
                    .monitor_signal
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            self.check_runners();
        }

        trace!("Monitor shutting down. Current state is {}.", self.state());
    }

    /// Refresh every running executor's timeout, escalating for those which
    /// have ignored the soft abort.
    ///
    /// Past the soft timeout plus one abort window the machine is destroyed.
    /// One further window, and the stuck worker is reported and woken. Two
    /// further windows, and the worker is abandoned and replaced.
    pub(super) fn check_runners(&self) {
        let soft = self.timeouts.soft_timeout();
        let abort = self.timeouts.abort_timeout();

        for runner in self.runner_snapshot() {
            let Some(handle) = runner.current() else {
                continue;
            };

            let timeout = handle.timeout();
            timeout.refresh();

            let elapsed = timeout.cumulative_elapsed();
            let Some(after_hard_abort) = elapsed.checked_sub(soft + abort) else {
                continue;
            };

            // Only on the pass that first crosses the line; the abort command
            // is already queued after that.
            if !timeout.is_hard_aborted() {
                timeout.hard_abort();
                write(&self.metrics).hard_aborts += 1;
                if let Some(worker) = handle.worker() {
                    worker.abort_with_timeout();
                }
            }

            if after_hard_abort >= abort * 2 {
                self.report_timeout(&runner, &handle, elapsed.saturating_sub(soft));
                runner.unpark();

                if self.worker_finished(&runner) {
                    write(&self.metrics).replaced_workers += 1;
                    error!(
                        "Worker {} failed to stop after a hard abort and has been replaced.",
                        runner.index
                    );
                }
            } else if after_hard_abort >= abort {
                self.report_timeout(&runner, &handle, elapsed.saturating_sub(soft));
                runner.unpark();
            }
        }
    }

    fn report_timeout(&self, runner: &Runner, handle: &ExecutorHandle, overrun: Duration) {
        let now = Instant::now();
        {
            let mut last = lock(&runner.last_report);
            if last.is_some_and(|then| now.duration_since(then) < REPORT_DEBOUNCE) {
                return;
            }
            *last = Some(now);
        }

        let worker = handle.worker();
        let computer = worker.as_ref().map(|w| w.computer_id());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Terminating computer #{} due to timeout (ran over by {:.3} seconds). This is NOT a bug, but may mean a computer is misbehaving.",
            computer.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string()),
            overrun.as_secs_f64()
        );
        let _ = writeln!(out, "Thread {} is currently running", runner.name());
        if let Some(worker) = worker {
            worker.write_state(&mut out);
        }

        warn!("{}", out.trim_end());
    }
}
