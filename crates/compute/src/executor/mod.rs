//! The per-computer lifecycle state machine.
//!
//! A [`ComputerExecutor`] owns one computer's machine, filesystem and APIs,
//! and is the [`Worker`] the [`ComputerThread`](crate::scheduler::ComputerThread)
//! runs for that computer. Each unit of work either performs one lifecycle
//! transition (turn on, shut down, reboot, abort) or delivers one event to
//! the machine.
//!
//! Two locks guard it. `queue` protects the pending command, the event queue
//! and the closed flag, and is only ever held briefly. `is_on_lock` is held
//! for the whole of a turn-on or shutdown, so that API updates from the host
//! thread never observe a half-built computer.

mod lifecycle;

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use cc_core::{Event, FileSystem, WritableMount};

use crate::api::ComputerApi;
use crate::context::ComputerContext;
use crate::environment::Environment;
use crate::error::ComputeError;
use crate::machine::{Machine, MachineError, MachineFactory, MachineResult};
use crate::scheduler::{ExecutionPermit, ExecutorHandle, WorkStatus, Worker};
use crate::sync::{lock, read, try_lock, write};
use crate::timeout::ABORT_MESSAGE;

/// A lifecycle transition waiting to be run by the next unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    TurnOn,
    Shutdown,
    Reboot,
    AbortWithTimeout,
    AbortWithError,
}

#[derive(Debug, Default)]
struct PendingWork {
    command: Option<StateCommand>,
    events: VecDeque<Event>,
    /// Set once the computer is unloaded. Nothing more is accepted.
    closed: bool,
}

pub struct ComputerExecutor {
    env: Arc<Environment>,
    machines: Arc<dyn MachineFactory>,
    handle: Arc<ExecutorHandle>,
    event_limit: usize,
    apis: RwLock<Vec<Arc<dyn ComputerApi>>>,
    queue: Mutex<PendingWork>,
    is_on: AtomicBool,
    is_on_lock: Mutex<()>,
    /// The machine yielded mid-event and must be resumed before anything else.
    was_paused: AtomicBool,
    machine: Mutex<Option<Arc<dyn Machine>>>,
    filesystem: Mutex<Option<FileSystem>>,
    root_mount: Mutex<Option<Arc<dyn WritableMount>>>,
}

impl ComputerExecutor {
    pub fn new(env: Arc<Environment>, context: &ComputerContext) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ComputerExecutor>| Self {
            env,
            machines: Arc::clone(context.machines()),
            handle: context.scheduler().create_executor(this.clone() as Weak<dyn Worker>),
            event_limit: context.limits().event_queue_limit,
            apis: RwLock::new(Vec::new()),
            queue: Mutex::new(PendingWork::default()),
            is_on: AtomicBool::new(false),
            is_on_lock: Mutex::new(()),
            was_paused: AtomicBool::new(false),
            machine: Mutex::new(None),
            filesystem: Mutex::new(None),
            root_mount: Mutex::new(None),
        })
    }

    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::Acquire)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn handle(&self) -> &Arc<ExecutorHandle> {
        &self.handle
    }

    /// Install an API. Takes effect from the next boot.
    pub fn add_api(&self, api: Arc<dyn ComputerApi>) {
        write(&self.apis).push(api);
    }

    /// Run `f` against the mounted filesystem, if the computer has one.
    pub fn with_filesystem<R>(&self, f: impl FnOnce(&FileSystem) -> R) -> Option<R> {
        lock(&self.filesystem).as_ref().map(f)
    }

    pub fn pending_command(&self) -> Option<StateCommand> {
        lock(&self.queue).command
    }

    pub fn queued_events(&self) -> usize {
        lock(&self.queue).events.len()
    }

    /// Ask for the computer to be turned on. Ignored if it is on, closed, or
    /// another transition is already pending.
    pub fn queue_start(&self) {
        {
            let mut queue = lock(&self.queue);
            if queue.closed || self.is_on() || queue.command.is_some() {
                return;
            }
            queue.command = Some(StateCommand::TurnOn);
        }
        self.enqueue();
    }

    /// Ask for the computer to be shut down (or rebooted), optionally closing
    /// it for good.
    pub fn queue_stop(&self, reboot: bool, close: bool) {
        {
            let mut queue = lock(&self.queue);
            if queue.closed {
                return;
            }
            queue.closed = close;

            let command = if reboot {
                StateCommand::Reboot
            } else {
                StateCommand::Shutdown
            };

            if !self.is_on() || queue.command.is_some() {
                // Closing must still win over a pending turn-on.
                if close {
                    queue.command = Some(command);
                }
                return;
            }

            queue.command = Some(command);
        }
        self.enqueue();
    }

    /// Queue an event for the machine. Dropped silently if the computer is
    /// off, closed, mid-transition or its queue is full.
    pub fn queue_event(&self, event: Event) -> bool {
        if !self.is_on() {
            return false;
        }

        {
            let mut queue = lock(&self.queue);
            if queue.closed || queue.command.is_some() || queue.events.len() >= self.event_limit {
                return false;
            }
            queue.events.push_back(event);
        }
        self.enqueue();
        true
    }

    /// Per-tick API updates. Skipped while a transition holds the lifecycle lock.
    pub fn tick(&self) {
        if !self.is_on() {
            return;
        }
        let Some(_guard) = try_lock(&self.is_on_lock) else {
            return;
        };
        if self.is_on() {
            for api in read(&self.apis).iter() {
                api.update();
            }
        }
    }

    /// Kill the machine now, from any thread, and schedule `command` to clean up.
    fn immediate_fail(&self, command: StateCommand) {
        let machine = lock(&self.machine).clone();
        if let Some(machine) = machine {
            machine.close();
        }

        {
            let mut queue = lock(&self.queue);
            if queue.closed {
                return;
            }
            queue.command = Some(command);
        }
        // Even when already off: the command must be consumed, or it would
        // block the next start.
        self.enqueue();
    }

    fn enqueue(&self) {
        if let Err(e) = self.handle.submit() {
            debug!(computer = self.env.id(), "Dropping work: {}", e);
        }
    }

    fn step(&self) -> Result<(), ComputeError> {
        let (command, event) = {
            let mut queue = lock(&self.queue);
            let command = queue.command.take();
            let mut event = None;
            if command.is_none() && !self.was_paused.load(Ordering::Acquire) {
                if !self.is_on() {
                    queue.events.clear();
                    return Ok(());
                }
                event = queue.events.pop_front();
            }
            (command, event)
        };

        let timeout = self.handle.timeout();
        if let Some(command) = command {
            self.was_paused.store(false, Ordering::Release);
            self.run_command(command);
            timeout.stop_timer();
        } else if self.was_paused.load(Ordering::Acquire) {
            self.resume_machine(None)?;
        } else if let Some(event) = event {
            self.resume_machine(Some(&event))?;
        }
        Ok(())
    }

    fn run_command(&self, command: StateCommand) {
        let is_on = self.is_on();
        match command {
            StateCommand::TurnOn => {
                if !is_on {
                    self.turn_on();
                }
            }
            StateCommand::Shutdown if is_on => {
                self.env.terminal().reset();
                self.shutdown();
            }
            StateCommand::Reboot if is_on => {
                self.env.terminal().reset();
                self.shutdown();
                self.env.request_start();
            }
            StateCommand::AbortWithTimeout if is_on => {
                self.display_failure("Error running computer", Some(ABORT_MESSAGE));
                self.shutdown();
            }
            StateCommand::AbortWithError if is_on => {
                self.display_failure("Error running computer", Some("An internal error occurred, see logs."));
                self.shutdown();
            }
            // Already off: a concurrent abort or a repeated stop.
            _ => {}
        }
    }

    fn resume_machine(&self, event: Option<&Event>) -> Result<(), ComputeError> {
        let machine = lock(&self.machine)
            .clone()
            .ok_or_else(|| MachineError("No machine to resume".to_string()))?;

        let timeout = self.handle.timeout();
        match machine.resume(event) {
            MachineResult::Completed => {
                self.was_paused.store(false, Ordering::Release);
                timeout.stop_timer();
            }
            MachineResult::Paused => {
                self.was_paused.store(true, Ordering::Release);
                timeout.pause_timer();
            }
            MachineResult::Failed(message) => {
                self.display_failure("Error running computer", Some(&message));
                self.shutdown();
                timeout.stop_timer();
            }
        }
        Ok(())
    }
}

impl Worker for ComputerExecutor {
    fn work(&self, _permit: &ExecutionPermit<'_>) -> Result<WorkStatus, ComputeError> {
        self.step()?;

        if self.was_paused.load(Ordering::Acquire) {
            return Ok(WorkStatus::Interrupted);
        }
        let queue = lock(&self.queue);
        let more = queue.command.is_some() || !queue.events.is_empty();
        Ok(if more { WorkStatus::MoreWork } else { WorkStatus::Done })
    }

    fn computer_id(&self) -> u32 {
        self.env.id()
    }

    fn write_state(&self, out: &mut String) {
        {
            let queue = lock(&self.queue);
            let _ = writeln!(out, "Enqueued command: {:?}", queue.command);
            let _ = writeln!(out, "Enqueued events: {}", queue.events.len());
        }

        let machine = lock(&self.machine).clone();
        if let Some(machine) = machine {
            machine.write_state(out);
        }
    }

    fn abort_with_timeout(&self) {
        self.immediate_fail(StateCommand::AbortWithTimeout);
    }

    fn abort_with_error(&self) {
        self.immediate_fail(StateCommand::AbortWithError);
    }

    fn unload(&self) {
        self.queue_stop(false, true);
    }
}
