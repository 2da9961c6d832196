use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use tracing::{info, trace};

use cc_core::{ComputerConfig, SchedulerConfig, TimeoutConfig};

use crate::error::ComputeError;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::queue::{RunQueue, enqueue_runtime};
use crate::scheduler::task::{ExecutorHandle, Worker};
use crate::sync::{lock, read};
use crate::timeout::TimeoutState;

pub(super) const RUNNING: u8 = 0;
pub(super) const STOPPING: u8 = 1;
pub(super) const CLOSED: u8 = 2;

/// One worker slot's current occupant.
pub(super) struct Runner {
    pub(super) index: usize,
    /// Identifies this runner's claims on executors. Never 0.
    pub(super) token: u64,
    /// Cleared when the runner exits or is abandoned by the monitor.
    pub(super) running: AtomicBool,
    pub(super) current: Mutex<Option<Arc<ExecutorHandle>>>,
    pub(super) last_report: Mutex<Option<Instant>>,
    pub(super) thread: OnceLock<Thread>,
}

impl Runner {
    fn new(index: usize, token: u64) -> Self {
        Self {
            index,
            token,
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            last_report: Mutex::new(None),
            thread: OnceLock::new(),
        }
    }

    pub(super) fn current(&self) -> Option<Arc<ExecutorHandle>> {
        lock(&self.current).clone()
    }

    pub(super) fn set_current(&self, handle: Arc<ExecutorHandle>) {
        *lock(&self.current) = Some(handle);
    }

    pub(super) fn take_current(&self) -> Option<Arc<ExecutorHandle>> {
        lock(&self.current).take()
    }

    pub(super) fn name(&self) -> String {
        self.thread
            .get()
            .and_then(|t| t.name().map(str::to_string))
            .unwrap_or_else(|| format!("computer-worker-{}", self.index))
    }

    pub(super) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

pub(super) struct Slots {
    pub(super) workers: Vec<Option<Arc<Runner>>>,
    /// Live runners, including ones the monitor has not yet reaped.
    pub(super) count: usize,
    pub(super) monitor: Option<JoinHandle<()>>,
}

/// Runs computers on a fixed pool of worker threads, fairly.
///
/// Ready executors wait in a queue ordered by virtual runtime: the time each
/// has spent running, divided by how many others were runnable meanwhile. The
/// executor with the least runtime goes next, so a computer hogging its
/// worker steadily loses priority to everyone else. A monitor thread watches
/// running executors and kills those that refuse to yield, replacing the
/// worker itself if it stays stuck.
///
/// Lock order is queue, then runner slots, then a runner's `current`.
pub struct ComputerThread {
    pub(super) self_ref: Weak<ComputerThread>,
    pub(super) timeouts: TimeoutConfig,
    pub(super) latency: Duration,
    pub(super) min_period: Duration,
    pub(super) monitor_wakeup: Duration,
    pub(super) sleep_credit: Duration,
    pub(super) penalize_new: bool,
    pub(super) state: AtomicU8,
    pub(super) queue: Mutex<RunQueue>,
    pub(super) work_available: Condvar,
    pub(super) monitor_signal: Condvar,
    /// Mirror of the queue length, readable without the queue lock.
    pub(super) pending: Arc<AtomicUsize>,
    pub(super) idle_workers: AtomicUsize,
    pub(super) runners: Mutex<Slots>,
    pub(super) workers_exited: Condvar,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(super) epoch: Instant,
    next_handle: AtomicU64,
    next_token: AtomicU64,
}

impl ComputerThread {
    /// Create a scheduler. No threads are started until work is first queued.
    pub fn new(config: &SchedulerConfig, timeouts: &TimeoutConfig) -> Arc<Self> {
        let threads = config.resolved_computer_threads().max(1);
        let latency = config.scaled_latency();
        let sleep_credit = match u32::try_from(config.sleep_credit_divisor) {
            Ok(0) => Duration::ZERO,
            Ok(divisor) => latency / divisor,
            Err(_) => Duration::ZERO,
        };

        info!(
            "Computer thread configured with {} workers (latency {:?}, min period {:?})",
            threads,
            latency,
            config.scaled_min_period()
        );

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            timeouts: timeouts.clone(),
            latency,
            min_period: config.scaled_min_period(),
            monitor_wakeup: config.monitor_wakeup(),
            sleep_credit,
            penalize_new: config.penalize_new_executors,
            state: AtomicU8::new(RUNNING),
            queue: Mutex::new(RunQueue::default()),
            work_available: Condvar::new(),
            monitor_signal: Condvar::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            idle_workers: AtomicUsize::new(0),
            runners: Mutex::new(Slots {
                workers: vec![None; threads],
                count: 0,
                monitor: None,
            }),
            workers_exited: Condvar::new(),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            epoch: Instant::now(),
            next_handle: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &ComputerConfig) -> Arc<Self> {
        Self::new(&config.scheduler, &config.timeout)
    }

    /// Register a worker, returning the handle it uses to submit work.
    pub fn create_executor(&self, worker: Weak<dyn Worker>) -> Arc<ExecutorHandle> {
        let timeout = Arc::new(TimeoutState::new(&self.timeouts, Arc::clone(&self.pending)));
        Arc::new(ExecutorHandle::new(
            self.next_handle.fetch_add(1, Ordering::Relaxed),
            worker,
            self.self_ref.clone(),
            timeout,
        ))
    }

    /// Put an executor on the ready queue. Only called by
    /// [`ExecutorHandle::submit`], which guarantees it is not already queued.
    pub(crate) fn queue(&self, handle: Arc<ExecutorHandle>) -> Result<(), ComputeError> {
        let mut queue = lock(&self.queue);
        if self.state() != RUNNING {
            return Err(ComputeError::SchedulerStopped);
        }

        self.ensure_running()?;
        self.update_runtimes(&mut queue, None);

        let penalty = if self.penalize_new {
            nanos(self.scaled_period_for(queue.len()))
        } else {
            0
        };
        let runtime = enqueue_runtime(
            handle.virtual_runtime(),
            queue.minimum_runtime,
            penalty,
            nanos(self.sleep_credit),
        );
        handle.set_virtual_runtime(runtime);

        let was_busy = self.is_busy_with(queue.len());
        queue.insert(handle);
        self.pending.store(queue.len(), Ordering::Release);
        self.work_available.notify_one();

        // Busy means something will need pausing soon, so the monitor should
        // wake every period rather than every wakeup interval.
        if !was_busy && self.is_busy_with(queue.len()) {
            self.monitor_signal.notify_one();
        }
        Ok(())
    }

    /// Make sure the monitor is alive and a worker is available. Called with
    /// the queue lock held.
    fn ensure_running(&self) -> Result<(), ComputeError> {
        let mut slots = lock(&self.runners);
        let idle = self.idle_workers.load(Ordering::Acquire);
        let monitor_alive = slots.monitor.as_ref().is_some_and(|m| !m.is_finished());
        if monitor_alive && (idle > 0 || slots.count == slots.workers.len()) {
            return Ok(());
        }

        trace!("Possibly spawning a worker or monitor.");

        if !monitor_alive {
            let this = self.self_ref.upgrade().ok_or(ComputeError::SchedulerStopped)?;
            let monitor = thread::Builder::new()
                .name("computer-monitor".to_string())
                .spawn(move || this.run_monitor())
                .map_err(|e| ComputeError::Spawn(format!("computer monitor: {}", e)))?;
            slots.monitor = Some(monitor);
        }

        if idle == 0 || slots.count < slots.workers.len() {
            if let Some(index) = slots.workers.iter().position(Option::is_none) {
                self.spawn_worker(&mut slots, index)?;
            }
        }
        Ok(())
    }

    pub(super) fn spawn_worker(&self, slots: &mut Slots, index: usize) -> Result<(), ComputeError> {
        let this = self.self_ref.upgrade().ok_or(ComputeError::SchedulerStopped)?;
        let runner = Arc::new(Runner::new(index, self.next_token.fetch_add(1, Ordering::Relaxed)));

        trace!("Spawning new worker {}.", index);
        let thread_runner = Arc::clone(&runner);
        let handle = thread::Builder::new()
            .name(format!("computer-worker-{}", index))
            .spawn(move || this.run_worker(thread_runner))
            .map_err(|e| ComputeError::Spawn(format!("computer worker {}: {}", index, e)))?;
        let _ = runner.thread.set(handle.thread().clone());

        slots.workers[index] = Some(runner);
        slots.count += 1;
        Ok(())
    }

    /// Stop every worker, waiting up to `timeout` for them to exit.
    ///
    /// Running computers are hard-aborted; anything still queued is unloaded
    /// as it is dispatched. Returns whether every worker exited in time.
    /// Either way the monitor is shut down: workers still stuck after the
    /// timeout are left to finish on their own, and may be waited on again.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.advance_state(STOPPING);
        info!("Stopping computer thread");

        for runner in self.runner_snapshot() {
            if let Some(handle) = runner.current() {
                handle.timeout().hard_abort();
            }
        }

        {
            let _queue = lock(&self.queue);
            self.work_available.notify_all();
        }

        let deadline = Instant::now() + timeout;
        let mut slots = lock(&self.runners);
        let mut remaining = slots.count;
        while remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slots = self
                .workers_exited
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            remaining = slots.count;
        }
        drop(slots);

        self.advance_state(CLOSED);

        // Wake the monitor so it notices, but don't wait for it.
        {
            let _queue = lock(&self.queue);
            self.monitor_signal.notify_all();
        }

        if remaining > 0 {
            info!("Computer thread did not stop in time ({} workers left)", remaining);
            return false;
        }
        info!("Computer thread stopped");
        true
    }

    /// Whether the monitor thread is still alive.
    pub fn is_monitor_running(&self) -> bool {
        lock(&self.runners)
            .monitor
            .as_ref()
            .is_some_and(|monitor| !monitor.is_finished())
    }

    fn advance_state(&self, new_state: u8) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < new_state).then_some(new_state)
            });
    }

    pub(super) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.state() == RUNNING
    }

    /// The time slice a dispatched executor gets before it is asked to pause.
    pub fn scaled_period(&self) -> Duration {
        self.scaled_period_for(self.pending.load(Ordering::Acquire))
    }

    pub(super) fn scaled_period_for(&self, queued: usize) -> Duration {
        // +1 for the executor being dispatched.
        let count = u32::try_from(queued.saturating_add(1)).unwrap_or(u32::MAX);
        (self.latency / count).max(self.min_period)
    }

    /// Whether any executor is waiting for a worker.
    pub fn has_pending_work(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Whether more executors are waiting than there are idle workers.
    pub fn is_busy(&self) -> bool {
        self.is_busy_with(self.pending.load(Ordering::Acquire))
    }

    pub(super) fn is_busy_with(&self, queued: usize) -> bool {
        queued > self.idle_workers.load(Ordering::Acquire)
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut metrics = read(&self.metrics).clone();
        metrics.queue_depth = self.pending.load(Ordering::Acquire);

        let slots = lock(&self.runners);
        let total = slots.workers.len().max(1);
        let busy = slots.count.saturating_sub(self.idle_workers.load(Ordering::Acquire));
        metrics.worker_utilization = busy as f64 / total as f64;
        metrics
    }

    /// Shared metrics, e.g. for the main-thread scheduler to record into.
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    pub(super) fn runner_snapshot(&self) -> Vec<Arc<Runner>> {
        lock(&self.runners).workers.iter().flatten().cloned().collect()
    }

    pub(super) fn now_nanos(&self) -> u64 {
        nanos(self.epoch.elapsed())
    }
}

pub(super) fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
