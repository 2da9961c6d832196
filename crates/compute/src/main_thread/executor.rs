use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::error;

use crate::error::ComputeError;
use crate::sync::lock;

use super::{MainThread, WorkMonitor, nanos};

/// A unit of work to run on the main thread.
pub type MainTask = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heat {
    /// Within budget.
    Cool,
    /// Overran this tick; waiting for the next one.
    Hot,
    /// Recovering. Does nothing until the budget is full again.
    Cooling,
}

struct State {
    tasks: VecDeque<MainTask>,
    on_queue: bool,
    heat: Heat,
    /// Remaining per-tick budget in nanoseconds.
    budget: i64,
    /// Tick the budget was last topped up for.
    budget_tick: Option<u64>,
    /// Time tracked outside tasks, not yet added to `virtual_time`.
    pending_time: u64,
    virtual_time: u64,
}

/// One computer's queue of main-thread tasks.
pub struct MainThreadExecutor {
    id: u64,
    self_ref: Weak<MainThreadExecutor>,
    scheduler: Arc<MainThread>,
    state: Mutex<State>,
}

impl MainThreadExecutor {
    pub(super) fn new(id: u64, scheduler: Arc<MainThread>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            self_ref: self_ref.clone(),
            scheduler,
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                on_queue: false,
                heat: Heat::Cool,
                budget: 0,
                budget_tick: None,
                pending_time: 0,
                virtual_time: 0,
            }),
        })
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn virtual_time(&self) -> u64 {
        lock(&self.state).virtual_time
    }

    pub fn pending_tasks(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    /// Queue a task. Returns false if this computer already has too many.
    pub fn enqueue(&self, task: MainTask) -> bool {
        {
            let mut state = lock(&self.state);
            if state.tasks.len() >= self.scheduler.config().task_limit {
                return false;
            }
            state.tasks.push_back(task);
            if state.on_queue || state.heat != Heat::Cool {
                return true;
            }
            state.on_queue = true;
        }
        self.schedule();
        true
    }

    fn schedule(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            self.scheduler.queue(this);
        }
    }

    /// Fold pending time into the virtual runtime and pick the runtime to
    /// queue with.
    pub(super) fn prepare_queue(&self, minimum_time: u64, penalty: u64) -> u64 {
        let mut state = lock(&self.state);
        let pending = mem::take(&mut state.pending_time);
        state.virtual_time += pending;

        let mut runtime = minimum_time;
        // Don't let a brand new computer jump ahead of everyone else.
        if state.virtual_time == 0 {
            runtime = runtime.saturating_add(penalty);
        }
        state.virtual_time = state.virtual_time.max(runtime);
        state.virtual_time
    }

    /// Run one task, if cool. Returns whether a task ran.
    pub(super) fn execute(&self) -> bool {
        let task = {
            let mut state = lock(&self.state);
            if state.heat != Heat::Cool {
                return false;
            }
            state.tasks.pop_front()
        };

        let Some(task) = task else {
            return false;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!("Error running main thread task: {}", ComputeError::from_panic(payload));
        }
        true
    }

    /// Charge `time` for the task just run. Returns whether to stay queued.
    pub(super) fn after_execute(&self, time: u64) -> bool {
        let mut state = lock(&self.state);
        self.consume_time(&mut state, time);

        let pending = mem::take(&mut state.pending_time);
        state.virtual_time += time + pending;
        if state.heat != Heat::Cool || state.tasks.is_empty() {
            state.on_queue = false;
            return false;
        }
        true
    }

    fn consume_time(&self, state: &mut State, time: u64) {
        let tick = self.scheduler.current_tick();
        if state.budget_tick != Some(tick) {
            state.budget_tick = Some(tick);
            state.budget = self.max_budget();
        }

        state.budget = state.budget.saturating_sub(i64::try_from(time).unwrap_or(i64::MAX));
        if state.budget < 0 && state.heat == Heat::Cool {
            state.heat = Heat::Hot;
            if let Some(this) = self.self_ref.upgrade() {
                self.scheduler.cooling(this);
            }
        }
    }

    /// Recover one tick's worth of budget. Returns true once cool again.
    pub(super) fn tick_cooling(&self) -> bool {
        {
            let mut state = lock(&self.state);
            state.heat = Heat::Cooling;
            state.budget_tick = Some(self.scheduler.current_tick());

            let max = self.max_budget();
            state.budget = state.budget.saturating_add(max).min(max);
            if state.budget < max {
                return false;
            }

            state.heat = Heat::Cool;
            if state.tasks.is_empty() || state.on_queue {
                return true;
            }
            state.on_queue = true;
        }
        self.schedule();
        true
    }

    fn max_budget(&self) -> i64 {
        i64::try_from(nanos(self.scheduler.config().max_computer_time())).unwrap_or(i64::MAX)
    }
}

impl WorkMonitor for MainThreadExecutor {
    fn can_work(&self) -> bool {
        lock(&self.state).heat != Heat::Cooling && self.scheduler.can_execute()
    }

    fn should_work(&self) -> bool {
        lock(&self.state).heat == Heat::Cool && self.scheduler.can_execute()
    }

    fn track_work(&self, time: Duration) {
        let time = nanos(time);
        {
            let mut state = lock(&self.state);
            state.pending_time += time;
            self.consume_time(&mut state, time);
        }
        self.scheduler.consume_time(time);
    }
}
