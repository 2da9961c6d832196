//! Shared fixtures for the integration tests: a scripted machine, a recording
//! API, an in-memory host and polling helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cc_compute::{
    ComputerApi, ComputerContext, ComputerEnvironment, ComputerExecutor, Environment,
    GlobalEnvironment, Machine, MachineContext, MachineError, MachineFactory, MachineResult,
};
use cc_core::{ComputerConfig, CoreError, Event, MemoryMount, Mount, Terminal, WritableMount};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `f` until it holds or `TIMEOUT` passes.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    f()
}

/// Config with short scheduler intervals so tests don't sit idle.
pub fn config(threads: usize) -> ComputerConfig {
    let mut config = ComputerConfig::default();
    config.scheduler.computer_threads = threads;
    config.scheduler.monitor_wakeup_ms = 10;
    config.computer.start_delay_ticks = 2;
    config
}

// ── Gate ────────────────────────────────────────────────────────────

/// A latch that machines can be parked on.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.changed.wait(open).unwrap();
        }
    }
}

// ── Scripted machine ────────────────────────────────────────────────

/// What every machine built by a [`ScriptedFactory`] saw, plus the knobs
/// controlling how they behave. Event names drive the behaviour:
///
/// - `block` parks on [`Recording::gate`];
/// - `pause` pauses once, then completes when resumed;
/// - `spin` burns CPU, pausing whenever asked, and never completes;
/// - `wedge` ignores every abort until [`Recording::release`] is set;
/// - `fail` returns an error;
/// - anything else completes at once.
#[derive(Default)]
pub struct Recording {
    events: Mutex<Vec<String>>,
    pub boots: AtomicUsize,
    pub closes: AtomicUsize,
    pub gate: Gate,
    pub release: AtomicBool,
    active: AtomicUsize,
    /// Most resumes ever seen in flight at once.
    pub max_active: AtomicUsize,
}

impl Recording {
    /// Names of every event resumed with, `None` resumes as `resume`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }

    fn push(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

pub struct ScriptedMachine {
    context: MachineContext,
    recording: Arc<Recording>,
    spinning: AtomicBool,
}

impl Machine for ScriptedMachine {
    fn load_boot(&self, bios: &[u8]) -> Result<(), MachineError> {
        if bios.is_empty() {
            return Err(MachineError("empty bios".into()));
        }
        self.recording.boots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self, event: Option<&Event>) -> MachineResult {
        let active = self.recording.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recording.max_active.fetch_max(active, Ordering::SeqCst);
        let result = self.step(event);
        self.recording.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn close(&self) {
        self.recording.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedMachine {
    fn step(&self, event: Option<&Event>) -> MachineResult {
        let Some(event) = event else {
            self.recording.push("resume");
            if self.spinning.load(Ordering::SeqCst) {
                return self.spin();
            }
            return MachineResult::Completed;
        };

        self.recording.push(&event.name);
        match event.name.as_str() {
            "block" => {
                self.recording.gate.wait();
                MachineResult::Completed
            }
            "pause" => MachineResult::Paused,
            "spin" => {
                self.spinning.store(true, Ordering::SeqCst);
                self.spin()
            }
            "wedge" => {
                while !self.recording.release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                MachineResult::Completed
            }
            "fail" => MachineResult::Failed("script error".into()),
            _ => MachineResult::Completed,
        }
    }

    fn spin(&self) -> MachineResult {
        let timeout = &self.context.timeout;
        loop {
            if timeout.is_soft_aborted() {
                return MachineResult::Failed(cc_compute::ABORT_MESSAGE.into());
            }
            if timeout.is_paused() {
                return MachineResult::Paused;
            }
            std::hint::spin_loop();
        }
    }
}

/// Builds machines sharing one [`Recording`] per computer ID.
#[derive(Default)]
pub struct ScriptedFactory {
    recordings: Mutex<Vec<(u32, Arc<Recording>)>>,
}

impl ScriptedFactory {
    pub fn recording(&self, computer: u32) -> Arc<Recording> {
        let mut recordings = self.recordings.lock().unwrap();
        if let Some((_, r)) = recordings.iter().find(|(id, _)| *id == computer) {
            return Arc::clone(r);
        }
        let recording = Arc::new(Recording::default());
        recordings.push((computer, Arc::clone(&recording)));
        recording
    }
}

impl MachineFactory for ScriptedFactory {
    fn create(&self, context: MachineContext) -> Result<Arc<dyn Machine>, MachineError> {
        let recording = self.recording(context.computer_id);
        Ok(Arc::new(ScriptedMachine {
            context,
            recording,
            spinning: AtomicBool::new(false),
        }))
    }
}

// ── Host ────────────────────────────────────────────────────────────

pub struct TestGlobal {
    ids: AtomicU32,
}

impl GlobalEnvironment for TestGlobal {
    fn host_string(&self) -> String {
        "integration-test".into()
    }

    fn rom_mount(&self) -> Option<Arc<dyn Mount>> {
        Some(Arc::new(MemoryMount::new(0).with_file("startup.lua", "")))
    }

    fn boot_resource(&self) -> Result<Vec<u8>, CoreError> {
        Ok(b"-- bios".to_vec())
    }

    fn next_computer_id(&self) -> u32 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct TestComputer;

impl ComputerEnvironment for TestComputer {
    fn create_root_mount(&self) -> Option<Arc<dyn WritableMount>> {
        Some(Arc::new(MemoryMount::new(1 << 20)))
    }
}

/// Counts lifecycle calls.
#[derive(Default)]
pub struct RecordingApi {
    pub startups: AtomicUsize,
    pub updates: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// How long `shutdown` takes, in milliseconds.
    pub shutdown_delay_ms: AtomicU64,
}

impl ComputerApi for RecordingApi {
    fn name(&self) -> &str {
        "recording"
    }

    fn startup(&self) {
        self.startups.fetch_add(1, Ordering::SeqCst);
    }

    fn update(&self) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        let delay = self.shutdown_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// A context plus the factory behind it. Stops the scheduler on drop.
pub struct Host {
    pub context: ComputerContext,
    pub machines: Arc<ScriptedFactory>,
}

impl Host {
    pub fn new(config: &ComputerConfig) -> Self {
        let machines = Arc::new(ScriptedFactory::default());
        let global = Arc::new(TestGlobal {
            ids: AtomicU32::new(0),
        });
        let context = ComputerContext::new(global, machines.clone(), config);
        Self { context, machines }
    }

    /// A bare executor for computer `id`, with a recording API installed.
    pub fn executor(&self, id: u32) -> (Arc<ComputerExecutor>, Arc<Recording>, Arc<RecordingApi>) {
        let env = Arc::new(Environment::new(
            Arc::clone(self.context.global()),
            Arc::new(TestComputer),
            Terminal::default(),
            Some(id),
        ));
        let executor = ComputerExecutor::new(env, &self.context);
        let api = Arc::new(RecordingApi::default());
        executor.add_api(api.clone());
        (executor, self.machines.recording(id), api)
    }

    /// Queue a start and wait for the boot resume to finish.
    pub fn boot(&self, id: u32) -> (Arc<ComputerExecutor>, Arc<Recording>, Arc<RecordingApi>) {
        let (executor, recording, api) = self.executor(id);
        executor.queue_start();
        assert!(wait_until(|| executor.is_on() && recording.count("resume") == 1));
        (executor, recording, api)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.context.close(Duration::from_secs(1));
    }
}
