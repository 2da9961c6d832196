//! The state a computer shares with its APIs and host: identity, terminal,
//! redstone and timers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::json;

use cc_core::{CoreError, Event, Mount, Terminal, WritableMount};

use crate::sync::lock;

pub const SIDE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bottom,
    Top,
    Back,
    Front,
    Right,
    Left,
}

impl Side {
    pub const ALL: [Side; SIDE_COUNT] = [
        Side::Bottom,
        Side::Top,
        Side::Back,
        Side::Front,
        Side::Right,
        Side::Left,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::Bottom => "bottom",
            Side::Top => "top",
            Side::Back => "back",
            Side::Front => "front",
            Side::Right => "right",
            Side::Left => "left",
        }
    }
}

/// Host-wide services shared by every computer.
pub trait GlobalEnvironment: Send + Sync {
    /// Identifies the host to running programs, e.g. `computer-host 0.1.0`.
    fn host_string(&self) -> String;

    /// The read-only ROM mounted at `/rom`, if available.
    fn rom_mount(&self) -> Option<Arc<dyn Mount>>;

    /// Contents of the boot program.
    fn boot_resource(&self) -> Result<Vec<u8>, CoreError>;

    /// Allocate a fresh computer ID.
    fn next_computer_id(&self) -> u32;
}

/// Per-computer services supplied by the host.
pub trait ComputerEnvironment: Send + Sync {
    /// The computer's writable root mount, if one can be created.
    fn create_root_mount(&self) -> Option<Arc<dyn WritableMount>>;
}

#[derive(Debug, Default)]
struct Redstone {
    internal_changed: bool,
    internal_output: [u8; SIDE_COUNT],
    internal_bundled: [u16; SIDE_COUNT],
    external_output: [u8; SIDE_COUNT],
    external_bundled: [u16; SIDE_COUNT],
    input_changed: bool,
    input: [u8; SIDE_COUNT],
    bundled_input: [u16; SIDE_COUNT],
}

#[derive(Debug, Default)]
struct Timers {
    next_id: u32,
    /// Remaining ticks by timer ID.
    pending: BTreeMap<u32, u64>,
}

pub struct Environment {
    id: OnceLock<u32>,
    global: Arc<dyn GlobalEnvironment>,
    computer: Arc<dyn ComputerEnvironment>,
    terminal: Mutex<Terminal>,
    start_requested: AtomicBool,
    redstone: Mutex<Redstone>,
    timers: Mutex<Timers>,
}

impl Environment {
    pub fn new(
        global: Arc<dyn GlobalEnvironment>,
        computer: Arc<dyn ComputerEnvironment>,
        terminal: Terminal,
        id: Option<u32>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(id) = id {
            let _ = cell.set(id);
        }
        Self {
            id: cell,
            global,
            computer,
            terminal: Mutex::new(terminal),
            start_requested: AtomicBool::new(false),
            redstone: Mutex::new(Redstone::default()),
            timers: Mutex::new(Timers::default()),
        }
    }

    /// The computer's ID, allocated from the global environment on first use.
    pub fn id(&self) -> u32 {
        *self.id.get_or_init(|| self.global.next_computer_id())
    }

    /// The ID if it has already been assigned.
    pub fn assigned_id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    pub fn global(&self) -> &Arc<dyn GlobalEnvironment> {
        &self.global
    }

    pub fn computer(&self) -> &Arc<dyn ComputerEnvironment> {
        &self.computer
    }

    pub fn terminal(&self) -> MutexGuard<'_, Terminal> {
        lock(&self.terminal)
    }

    /// Ask for the computer to be turned on at its next tick.
    pub fn request_start(&self) {
        self.start_requested.store(true, Ordering::Release);
    }

    pub fn start_requested(&self) -> bool {
        self.start_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_start_request(&self) {
        self.start_requested.store(false, Ordering::Release);
    }

    // ── Redstone ────────────────────────────────────────────────────

    pub fn set_output(&self, side: Side, level: u8) {
        let mut rs = lock(&self.redstone);
        let level = level.min(15);
        if rs.internal_output[side.index()] != level {
            rs.internal_output[side.index()] = level;
            rs.internal_changed = true;
        }
    }

    pub fn output(&self, side: Side) -> u8 {
        lock(&self.redstone).internal_output[side.index()]
    }

    pub fn set_bundled_output(&self, side: Side, combination: u16) {
        let mut rs = lock(&self.redstone);
        if rs.internal_bundled[side.index()] != combination {
            rs.internal_bundled[side.index()] = combination;
            rs.internal_changed = true;
        }
    }

    pub fn bundled_output(&self, side: Side) -> u16 {
        lock(&self.redstone).internal_bundled[side.index()]
    }

    /// Output as last published to the world by [`Environment::update_output`].
    pub fn external_output(&self, side: Side) -> u8 {
        lock(&self.redstone).external_output[side.index()]
    }

    pub fn external_bundled_output(&self, side: Side) -> u16 {
        lock(&self.redstone).external_bundled[side.index()]
    }

    pub fn set_input(&self, side: Side, level: u8) {
        let mut rs = lock(&self.redstone);
        let level = level.min(15);
        if rs.input[side.index()] != level {
            rs.input[side.index()] = level;
            rs.input_changed = true;
        }
    }

    pub fn input(&self, side: Side) -> u8 {
        lock(&self.redstone).input[side.index()]
    }

    pub fn set_bundled_input(&self, side: Side, combination: u16) {
        let mut rs = lock(&self.redstone);
        if rs.bundled_input[side.index()] != combination {
            rs.bundled_input[side.index()] = combination;
            rs.input_changed = true;
        }
    }

    pub fn bundled_input(&self, side: Side) -> u16 {
        lock(&self.redstone).bundled_input[side.index()]
    }

    /// Publish internal output to the world. Returns whether anything changed.
    pub fn update_output(&self) -> bool {
        let mut rs = lock(&self.redstone);
        if !rs.internal_changed {
            return false;
        }
        rs.internal_changed = false;

        let mut changed = false;
        for i in 0..SIDE_COUNT {
            if rs.external_output[i] != rs.internal_output[i] {
                rs.external_output[i] = rs.internal_output[i];
                changed = true;
            }
            if rs.external_bundled[i] != rs.internal_bundled[i] {
                rs.external_bundled[i] = rs.internal_bundled[i];
                changed = true;
            }
        }
        changed
    }

    pub fn reset_output(&self) {
        let mut rs = lock(&self.redstone);
        rs.internal_output = [0; SIDE_COUNT];
        rs.internal_bundled = [0; SIDE_COUNT];
        rs.internal_changed = true;
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Start a timer firing after `ticks` ticks. Returns its ID.
    pub fn start_timer(&self, ticks: u64) -> u32 {
        let mut timers = lock(&self.timers);
        timers.next_id = timers.next_id.wrapping_add(1);
        let id = timers.next_id;
        timers.pending.insert(id, ticks);
        id
    }

    pub fn cancel_timer(&self, id: u32) -> bool {
        lock(&self.timers).pending.remove(&id).is_some()
    }

    /// Forget per-boot state. Called on every power transition.
    pub fn reset(&self) {
        lock(&self.timers).pending.clear();
    }

    /// Advance one tick, returning the events which should be queued.
    pub fn tick(&self) -> Vec<Event> {
        let mut events = Vec::new();

        {
            let mut rs = lock(&self.redstone);
            if rs.input_changed {
                rs.input_changed = false;
                events.push(Event::named("redstone"));
            }
        }

        let mut timers = lock(&self.timers);
        let mut fired = Vec::new();
        for (id, remaining) in timers.pending.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                fired.push(*id);
            }
        }
        for id in fired {
            timers.pending.remove(&id);
            events.push(Event::new("timer", vec![json!(id)]));
        }

        events
    }
}
