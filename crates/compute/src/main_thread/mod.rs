//! Budgeted scheduler for work which must run on the host's main thread.
//!
//! Unlike the [`ComputerThread`](crate::scheduler::ComputerThread) there is
//! no worker pool: the host calls [`MainThread::tick`] once per game tick and
//! tasks run inline, fairest first, until the tick's time budget is spent.
//! Each computer also has its own per-tick budget; one which overruns it is
//! made to cool down, doing nothing at all until its budget has fully
//! recovered.

mod executor;

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

use cc_core::MainThreadConfig;

use crate::scheduler::SchedulerMetrics;
use crate::sync::{lock, write};

pub use self::executor::{MainTask, MainThreadExecutor};

/// Lets long-running work on the main thread account for itself.
pub trait WorkMonitor {
    /// Whether the computer may do any work at all this tick.
    fn can_work(&self) -> bool;

    /// Whether the computer should do work this tick. Stricter than
    /// [`WorkMonitor::can_work`]: also false once the budget is overdrawn.
    fn should_work(&self) -> bool;

    /// Charge `time` spent outside of a queued task.
    fn track_work(&self, time: Duration);
}

#[derive(Default)]
struct ReadyQueue {
    executors: BTreeMap<(u64, u64), Arc<MainThreadExecutor>>,
    minimum_time: u64,
}

/// Lock order is queue, then an executor's own state, then `cooling`.
pub struct MainThread {
    config: MainThreadConfig,
    queue: Mutex<ReadyQueue>,
    /// Executors which overran their budget and are recovering.
    cooling: Mutex<Vec<Arc<MainThreadExecutor>>>,
    current_tick: AtomicU64,
    /// Global budget in nanoseconds. Goes negative when a tick overruns.
    budget: AtomicI64,
    can_execute: AtomicBool,
    next_id: AtomicU64,
    metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl MainThread {
    pub fn new(config: &MainThreadConfig) -> Self {
        Self::with_metrics(config, Arc::new(RwLock::new(SchedulerMetrics::default())))
    }

    /// Record into an existing metrics snapshot, usually the compute scheduler's.
    pub fn with_metrics(config: &MainThreadConfig, metrics: Arc<RwLock<SchedulerMetrics>>) -> Self {
        Self {
            config: config.clone(),
            queue: Mutex::new(ReadyQueue::default()),
            cooling: Mutex::new(Vec::new()),
            current_tick: AtomicU64::new(0),
            budget: AtomicI64::new(0),
            can_execute: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn create_executor(self: &Arc<Self>) -> Arc<MainThreadExecutor> {
        MainThreadExecutor::new(self.next_id.fetch_add(1, Ordering::Relaxed), Arc::clone(self))
    }

    pub fn config(&self) -> &MainThreadConfig {
        &self.config
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    pub fn can_execute(&self) -> bool {
        self.can_execute.load(Ordering::Acquire)
    }

    /// Remaining global budget for this tick. Negative after an overrun.
    pub fn budget(&self) -> i64 {
        self.budget.load(Ordering::Acquire)
    }

    pub fn queued_executors(&self) -> usize {
        lock(&self.queue).executors.len()
    }

    /// Add an executor to the ready queue. Its `on_queue` flag must already
    /// have been claimed by the caller.
    pub(crate) fn queue(&self, executor: Arc<MainThreadExecutor>) {
        let mut queue = lock(&self.queue);
        let penalty = nanos(self.config.max_computer_time());
        let runtime = executor.prepare_queue(queue.minimum_time, penalty);
        queue.executors.insert((runtime, executor.id()), executor);
    }

    pub(crate) fn cooling(&self, executor: Arc<MainThreadExecutor>) {
        lock(&self.cooling).push(executor);
    }

    pub(crate) fn consume_time(&self, time: u64) {
        self.budget
            .fetch_sub(i64::try_from(time).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Run one tick: top up budgets, let hot executors cool, then run queued
    /// tasks until the queue is empty or the global budget is gone.
    pub fn tick(&self) {
        self.current_tick.fetch_add(1, Ordering::AcqRel);

        // Clamped, so a long overrun skips whole ticks until it is paid off.
        let max_global = i64::try_from(nanos(self.config.max_global_time())).unwrap_or(i64::MAX);
        let budget = self
            .budget
            .load(Ordering::Acquire)
            .saturating_add(max_global)
            .min(max_global);
        self.budget.store(budget, Ordering::Release);
        let can_execute = budget > 0;
        self.can_execute.store(can_execute, Ordering::Release);

        let cooling = mem::take(&mut *lock(&self.cooling));
        let still_cooling: Vec<_> = cooling.into_iter().filter(|e| !e.tick_cooling()).collect();
        lock(&self.cooling).extend(still_cooling);

        if !can_execute {
            write(&self.metrics).skipped_ticks += 1;
            trace!(budget, "Skipping main thread tick");
            return;
        }

        let start = Instant::now();
        let deadline = start + Duration::from_nanos(budget.unsigned_abs());
        let mut executed = 0u64;
        loop {
            let next = lock(&self.queue).executors.pop_first().map(|(_, e)| e);
            let Some(executor) = next else {
                break;
            };

            let task_start = Instant::now();
            if executor.execute() {
                executed += 1;
            }
            let task_stop = Instant::now();

            {
                let mut queue = lock(&self.queue);
                let elapsed = nanos(task_stop - task_start);
                if executor.after_execute(elapsed) {
                    queue.executors.insert((executor.virtual_time(), executor.id()), Arc::clone(&executor));
                }

                let mut minimum = executor.virtual_time();
                if let Some(((first, _), _)) = queue.executors.first_key_value() {
                    minimum = minimum.min(*first);
                }
                queue.minimum_time = queue.minimum_time.max(minimum);
            }

            if task_stop >= deadline {
                break;
            }
        }

        self.consume_time(nanos(start.elapsed()));
        write(&self.metrics).main_tasks_executed += executed;
    }
}

pub(crate) fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn config(global_ms: u64, computer_ms: u64) -> MainThreadConfig {
        MainThreadConfig {
            max_main_global_time_ms: global_ms,
            max_main_computer_time_ms: computer_ms,
            task_limit: 3,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> MainTask) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        (count, move || {
            let shared = Arc::clone(&shared);
            Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            }) as MainTask
        })
    }

    #[test]
    fn runs_queued_tasks_on_tick() {
        let main = Arc::new(MainThread::new(&config(50, 50)));
        let executor = main.create_executor();
        let (count, task) = counter();

        assert!(executor.enqueue(task()));
        assert!(executor.enqueue(task()));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        main.tick();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(main.queued_executors(), 0);
    }

    #[test]
    fn task_limit_is_enforced() {
        let main = Arc::new(MainThread::new(&config(50, 50)));
        let executor = main.create_executor();
        let (_count, task) = counter();

        for _ in 0..3 {
            assert!(executor.enqueue(task()));
        }
        assert!(!executor.enqueue(task()));
    }

    #[test]
    fn overrunning_computer_cools_down() {
        let main = Arc::new(MainThread::new(&config(1_000, 5)));
        let hog = main.create_executor();
        let (count, task) = counter();

        assert!(hog.enqueue(Box::new(|| thread::sleep(Duration::from_millis(12)))));
        assert!(hog.enqueue(task()));

        main.tick();
        // The first task blew the 5ms budget, so the second must wait.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!hog.should_work());

        // Cooling needs the budget back to full: -7ms +5ms is still short.
        main.tick();
        assert!(!hog.can_work());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            main.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hog.can_work());
    }

    #[test]
    fn global_overrun_skips_ticks() {
        let main = Arc::new(MainThread::new(&config(5, 1_000)));
        let executor = main.create_executor();
        let (count, task) = counter();

        executor.track_work(Duration::from_millis(12));
        assert!(executor.enqueue(task()));

        // 5 - 12 = -7 -> -2 -> 3: two skipped ticks, then work resumes.
        main.tick();
        assert!(!main.can_execute());
        assert!(!executor.can_work());
        main.tick();
        assert!(!main.can_execute());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        main.tick();
        assert!(main.can_execute());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(main.metrics.read().unwrap().skipped_ticks, 2);
    }

    #[test]
    fn executors_take_turns() {
        let main = Arc::new(MainThread::new(&MainThreadConfig {
            task_limit: 100,
            ..config(1_000, 1_000)
        }));
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = main.create_executor();
        let b = main.create_executor();
        for _ in 0..3 {
            for (name, executor) in [("a", &a), ("b", &b)] {
                let order = Arc::clone(&order);
                assert!(executor.enqueue(Box::new(move || {
                    thread::sleep(Duration::from_millis(1));
                    order.lock().unwrap().push(name);
                })));
            }
        }

        main.tick();
        let order = order.lock().unwrap().clone();
        assert_eq!(order.len(), 6);
        // Equal runtimes to start with, after which `a` has been charged.
        assert_eq!(order[..2], ["a", "b"]);
    }

    #[test]
    fn panicking_task_does_not_poison_the_tick() {
        let main = Arc::new(MainThread::new(&config(50, 50)));
        let executor = main.create_executor();
        let (count, task) = counter();

        assert!(executor.enqueue(Box::new(|| panic!("task failed"))));
        assert!(executor.enqueue(task()));
        main.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
