//! Per-computer execution clock.
//!
//! A [`TimeoutState`] tracks two windows:
//!
//! - the *cumulative* window, which spans every slice spent on one event
//!   (surviving pauses), and drives the soft and hard abort flags;
//! - the *current* slice, started each time a worker picks the computer up,
//!   whose deadline decides when the machine should pause so that others
//!   can run.
//!
//! The machine polls the flags; the monitor thread calls [`TimeoutState::refresh`]
//! and [`TimeoutState::hard_abort`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cc_core::TimeoutConfig;

use crate::sync::lock;

/// Message shown when a computer is killed for not yielding.
pub const ABORT_MESSAGE: &str = "Too long without yielding";

#[derive(Debug)]
struct Clock {
    running: bool,
    cumulative_start: Instant,
    cumulative_elapsed: Duration,
    current_start: Instant,
    current_deadline: Instant,
}

#[derive(Debug)]
pub struct TimeoutState {
    soft_timeout: Duration,
    abort_timeout: Duration,
    /// Number of executors waiting on the scheduler. Pausing only makes sense
    /// when someone else wants the worker.
    contention: Arc<AtomicUsize>,
    clock: Mutex<Clock>,
    paused: AtomicBool,
    soft_abort: AtomicBool,
    hard_abort: AtomicBool,
}

impl TimeoutState {
    pub fn new(config: &TimeoutConfig, contention: Arc<AtomicUsize>) -> Self {
        let now = Instant::now();
        Self {
            soft_timeout: config.soft_timeout(),
            abort_timeout: config.abort_timeout(),
            contention,
            clock: Mutex::new(Clock {
                running: false,
                cumulative_start: now,
                cumulative_elapsed: Duration::ZERO,
                current_start: now,
                current_deadline: now,
            }),
            paused: AtomicBool::new(false),
            soft_abort: AtomicBool::new(false),
            hard_abort: AtomicBool::new(false),
        }
    }

    /// A timer with no scheduler behind it; it never sees contention.
    pub fn detached(config: &TimeoutConfig) -> Self {
        Self::new(config, Arc::new(AtomicUsize::new(0)))
    }

    /// Begin a new slice of at most `period`, continuing the cumulative window.
    pub fn start_timer(&self, period: Duration) {
        let now = Instant::now();
        let mut clock = lock(&self.clock);
        clock.running = true;
        clock.current_start = now;
        clock.current_deadline = now + period;
        clock.cumulative_start = now.checked_sub(clock.cumulative_elapsed).unwrap_or(now);
    }

    /// The machine yielded mid-event: freeze the cumulative clock.
    pub fn pause_timer(&self) {
        let mut clock = lock(&self.clock);
        if clock.running {
            clock.cumulative_elapsed = clock.cumulative_start.elapsed();
            clock.running = false;
        }
        self.paused.store(false, Ordering::Release);
    }

    /// The event finished: start a fresh cumulative window next time.
    pub fn stop_timer(&self) {
        let mut clock = lock(&self.clock);
        clock.running = false;
        clock.cumulative_elapsed = Duration::ZERO;
        self.paused.store(false, Ordering::Release);
        self.soft_abort.store(false, Ordering::Release);
        self.hard_abort.store(false, Ordering::Release);
    }

    /// Recompute the pause and soft abort flags. Neither is cleared here.
    pub fn refresh(&self) {
        let now = Instant::now();
        let clock = lock(&self.clock);
        if !clock.running {
            return;
        }

        if now >= clock.current_deadline && self.contention.load(Ordering::Acquire) > 0 {
            self.paused.store(true, Ordering::Release);
        }

        if now.saturating_duration_since(clock.cumulative_start) >= self.soft_timeout {
            self.soft_abort.store(true, Ordering::Release);
        }
    }

    /// Force-terminate the current run.
    pub fn hard_abort(&self) {
        self.soft_abort.store(true, Ordering::Release);
        self.hard_abort.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_soft_aborted(&self) -> bool {
        self.soft_abort.load(Ordering::Acquire)
    }

    pub fn is_hard_aborted(&self) -> bool {
        self.hard_abort.load(Ordering::Acquire)
    }

    /// Time spent on the current event, across every slice so far.
    pub fn cumulative_elapsed(&self) -> Duration {
        let clock = lock(&self.clock);
        if clock.running {
            clock.cumulative_start.elapsed()
        } else {
            clock.cumulative_elapsed
        }
    }

    /// Time spent in the current slice, or zero when not running.
    pub fn current_elapsed(&self) -> Duration {
        let clock = lock(&self.clock);
        if clock.running {
            clock.current_start.elapsed()
        } else {
            Duration::ZERO
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.clock).running
    }

    pub fn soft_timeout(&self) -> Duration {
        self.soft_timeout
    }

    pub fn abort_timeout(&self) -> Duration {
        self.abort_timeout
    }
}
