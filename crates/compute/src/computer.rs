use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cc_core::{Event, Terminal};

use crate::api::ComputerApi;
use crate::context::ComputerContext;
use crate::environment::{ComputerEnvironment, Environment, Side};
use crate::executor::ComputerExecutor;
use crate::main_thread::{MainTask, MainThreadExecutor, WorkMonitor};
use crate::sync::lock;

#[derive(Debug)]
struct TickState {
    /// Ticks since the last start, saturating just past the start delay.
    /// Negative until the computer has been started once.
    ticks_since_start: i64,
    blinking: bool,
}

/// A single computer: the host-facing surface over its executor,
/// environment and main-thread queue.
///
/// The host must call [`Computer::tick`] once per game tick.
pub struct Computer {
    env: Arc<Environment>,
    executor: Arc<ComputerExecutor>,
    main_executor: Arc<MainThreadExecutor>,
    start_delay: i64,
    label: Mutex<Option<String>>,
    tick_state: Mutex<TickState>,
    changed: AtomicBool,
    last_task_id: AtomicU64,
}

impl Computer {
    /// Create a computer. Without an `id` one is allocated from the global
    /// environment the first time it is needed.
    pub fn new(
        context: &ComputerContext,
        environment: Arc<dyn ComputerEnvironment>,
        terminal: Terminal,
        id: Option<u32>,
    ) -> Self {
        let env = Arc::new(Environment::new(
            Arc::clone(context.global()),
            environment,
            terminal,
            id,
        ));
        let executor = ComputerExecutor::new(Arc::clone(&env), context);

        Self {
            env,
            executor,
            main_executor: context.main_thread().create_executor(),
            start_delay: i64::from(context.limits().start_delay_ticks),
            label: Mutex::new(None),
            tick_state: Mutex::new(TickState {
                ticks_since_start: -1,
                blinking: false,
            }),
            changed: AtomicBool::new(false),
            last_task_id: AtomicU64::new(0),
        }
    }

    /// The ID, if one has been assigned yet.
    pub fn id(&self) -> Option<u32> {
        self.env.assigned_id()
    }

    /// The ID, allocating one if needed.
    pub fn assign_id(&self) -> u32 {
        self.env.id()
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn executor(&self) -> &Arc<ComputerExecutor> {
        &self.executor
    }

    pub fn terminal(&self) -> MutexGuard<'_, Terminal> {
        self.env.terminal()
    }

    pub fn label(&self) -> Option<String> {
        lock(&self.label).clone()
    }

    pub fn set_label(&self, label: Option<String>) {
        let mut current = lock(&self.label);
        if *current != label {
            *current = label;
            self.mark_changed();
        }
    }

    pub fn is_on(&self) -> bool {
        self.executor.is_on()
    }

    /// Turn on at the next tick, once the start delay has passed.
    pub fn turn_on(&self) {
        self.env.request_start();
    }

    pub fn shutdown(&self) {
        self.executor.queue_stop(false, false);
    }

    pub fn reboot(&self) {
        self.executor.queue_stop(true, false);
    }

    /// Shut down for good. Nothing is accepted afterwards.
    pub fn unload(&self) {
        self.executor.queue_stop(false, true);
    }

    pub fn queue_event(&self, event: Event) -> bool {
        self.executor.queue_event(event)
    }

    pub fn add_api(&self, api: Arc<dyn ComputerApi>) {
        self.executor.add_api(api);
    }

    pub fn queue_main_thread(&self, task: MainTask) -> bool {
        self.main_executor.enqueue(task)
    }

    pub fn main_thread_monitor(&self) -> &dyn WorkMonitor {
        self.main_executor.as_ref()
    }

    pub fn unique_task_id(&self) -> u64 {
        self.last_task_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Redstone output as seen by the world. Always 0 while off.
    pub fn redstone_output(&self, side: Side) -> u8 {
        if self.is_on() { self.env.external_output(side) } else { 0 }
    }

    pub fn bundled_redstone_output(&self, side: Side) -> u16 {
        if self.is_on() { self.env.external_bundled_output(side) } else { 0 }
    }

    pub fn set_redstone_input(&self, side: Side, level: u8) {
        self.env.set_input(side, level);
    }

    pub fn set_bundled_redstone_input(&self, side: Side, combination: u16) {
        self.env.set_bundled_input(side, combination);
    }

    pub fn is_blinking(&self) -> bool {
        self.is_on() && lock(&self.tick_state).blinking
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    /// Whether anything the world can see changed since the last poll.
    pub fn poll_and_reset_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    pub fn tick(&self) {
        let start = {
            let mut state = lock(&self.tick_state);
            if (0..=self.start_delay).contains(&state.ticks_since_start) {
                state.ticks_since_start += 1;
            }

            let may_start = state.ticks_since_start < 0 || state.ticks_since_start > self.start_delay;
            if self.env.start_requested() && may_start {
                self.env.clear_start_request();
                if !self.executor.is_on() {
                    state.ticks_since_start = 0;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if start {
            self.executor.queue_start();
        }

        self.executor.tick();

        for event in self.env.tick() {
            self.executor.queue_event(event);
        }

        if self.env.update_output() {
            self.mark_changed();
        }

        let blinking = self.env.terminal().cursor_visible();
        let mut state = lock(&self.tick_state);
        if blinking != state.blinking {
            state.blinking = blinking;
            self.mark_changed();
        }
    }
}
