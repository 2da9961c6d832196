//! computer-host: runs a set of demo computers on the scheduler.
//!
//! Boots `--computers` computers running a small built-in machine, drives
//! the host tick loop at 20 Hz while feeding them events and redstone input,
//! then shuts everything down and prints the scheduler metrics as JSON.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use cc_compute::{
    ABORT_MESSAGE, Computer, ComputerApi, ComputerContext, ComputerEnvironment, GlobalEnvironment,
    Machine, MachineContext, MachineError, MachineFactory, MachineResult, Side,
};
use cc_core::{ComputerConfig, CoreError, Event, MemoryMount, Mount, Terminal, WritableMount};

const TICK: Duration = Duration::from_millis(50);

// ── CLI ─────────────────────────────────────────────────────────────

/// Run demo computers on the computer scheduler.
#[derive(Parser, Debug)]
#[command(name = "computer-host", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults to environment variables.
    #[arg(long, env = "CC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of computers to boot.
    #[arg(long, default_value_t = 8)]
    computers: u32,

    /// Worker threads; overrides the configured value (0 = one per core).
    #[arg(long)]
    threads: Option<usize>,

    /// Host ticks to run for.
    #[arg(long, default_value_t = 200)]
    ticks: u64,

    /// Events queued on every computer each tick.
    #[arg(long, default_value_t = 2)]
    events_per_tick: u32,
}

// ── Demo machine ────────────────────────────────────────────────────

/// Burns a fixed amount of CPU per event, pausing whenever the scheduler
/// asks it to and giving up when aborted.
struct DemoMachine {
    context: MachineContext,
    work_per_event: u64,
    /// Work left on the current event, if paused mid-way.
    remaining: Mutex<Option<u64>>,
    closed: AtomicBool,
    handled: AtomicU64,
}

impl Machine for DemoMachine {
    fn load_boot(&self, bios: &[u8]) -> Result<(), MachineError> {
        if bios.is_empty() {
            return Err(MachineError("bios is empty".into()));
        }
        Ok(())
    }

    fn resume(&self, event: Option<&Event>) -> MachineResult {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        let mut left = match (event, remaining.take()) {
            (None, Some(left)) => left,
            _ => self.work_per_event,
        };

        let timeout = &self.context.timeout;
        let mut acc = u64::from(self.context.computer_id);
        while left > 0 {
            if self.closed.load(Ordering::Acquire) || timeout.is_hard_aborted() {
                return MachineResult::Failed(ABORT_MESSAGE.into());
            }
            if timeout.is_soft_aborted() {
                return MachineResult::Failed(ABORT_MESSAGE.into());
            }
            if timeout.is_paused() {
                *remaining = Some(left);
                return MachineResult::Paused;
            }

            let chunk = left.min(10_000);
            for i in 0..chunk {
                acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
            }
            std::hint::black_box(acc);
            left -= chunk;
        }

        self.handled.fetch_add(1, Ordering::Relaxed);
        MachineResult::Completed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn write_state(&self, out: &mut String) {
        out.push_str(&format!(
            "Demo machine on {} handled {} events\n",
            self.context.host,
            self.handled.load(Ordering::Relaxed)
        ));
    }
}

struct DemoFactory {
    work_per_event: u64,
}

impl MachineFactory for DemoFactory {
    fn create(&self, context: MachineContext) -> Result<Arc<dyn Machine>, MachineError> {
        Ok(Arc::new(DemoMachine {
            context,
            work_per_event: self.work_per_event,
            remaining: Mutex::new(None),
            closed: AtomicBool::new(false),
            handled: AtomicU64::new(0),
        }))
    }
}

// ── Host environment ────────────────────────────────────────────────

struct HostGlobal {
    next_id: AtomicU32,
    rom: Arc<MemoryMount>,
}

impl GlobalEnvironment for HostGlobal {
    fn host_string(&self) -> String {
        format!("computer-host {}", env!("CARGO_PKG_VERSION"))
    }

    fn rom_mount(&self) -> Option<Arc<dyn Mount>> {
        Some(self.rom.clone())
    }

    fn boot_resource(&self) -> Result<Vec<u8>, CoreError> {
        self.rom.read("bios.lua")
    }

    fn next_computer_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct HostComputer;

impl ComputerEnvironment for HostComputer {
    fn create_root_mount(&self) -> Option<Arc<dyn WritableMount>> {
        Some(Arc::new(MemoryMount::new(1_000_000)))
    }
}

/// Counts host ticks seen while the computer is on.
#[derive(Default)]
struct UptimeApi {
    ticks: AtomicU64,
}

impl ComputerApi for UptimeApi {
    fn name(&self) -> &str {
        "uptime"
    }

    fn startup(&self) {
        self.ticks.store(0, Ordering::Relaxed);
    }

    fn update(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    cc_core::load_dotenv();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ComputerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ComputerConfig::from_env(),
    };
    if let Some(threads) = cli.threads {
        config.scheduler.computer_threads = threads;
    }
    config.log_summary();

    let global = Arc::new(HostGlobal {
        next_id: AtomicU32::new(0),
        rom: Arc::new(
            MemoryMount::new(0)
                .with_file("bios.lua", "-- demo bios")
                .with_file("programs/hello.lua", "print('hello')"),
        ),
    });
    let context = ComputerContext::new(global, Arc::new(DemoFactory { work_per_event: 200_000 }), &config);

    let computers: Vec<(Computer, Arc<UptimeApi>)> = (0..cli.computers)
        .map(|_| {
            let computer = Computer::new(&context, Arc::new(HostComputer), Terminal::default(), None);
            let uptime = Arc::new(UptimeApi::default());
            computer.add_api(uptime.clone());
            computer.turn_on();
            (computer, uptime)
        })
        .collect();
    info!("Created {} computers", computers.len());

    let started = Instant::now();
    for tick in 0..cli.ticks {
        let tick_start = Instant::now();
        context.main_thread().tick();

        for (computer, _) in &computers {
            if computer.is_on() {
                for i in 0..cli.events_per_tick {
                    computer.queue_event(Event::new("demo", vec![json!(tick), json!(i)]));
                }
                if tick % 20 == 0 {
                    computer.set_redstone_input(Side::Back, ((tick / 20) % 16) as u8);
                    let id = computer.unique_task_id();
                    computer.queue_main_thread(Box::new(move || {
                        tracing::debug!(task = id, "Main thread task ran");
                    }));
                }
            }
            computer.tick();
        }

        if let Some(rest) = TICK.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        } else {
            warn!(tick, "Host tick overran by {:?}", tick_start.elapsed() - TICK);
        }
    }

    let on = computers.iter().filter(|(c, _)| c.is_on()).count();
    let uptime: u64 = computers.iter().map(|(_, u)| u.ticks.load(Ordering::Relaxed)).sum();
    info!(
        "Ran {} ticks in {:?}: {}/{} computers on, {} API updates",
        cli.ticks,
        started.elapsed(),
        on,
        computers.len(),
        uptime
    );

    for (computer, _) in &computers {
        computer.unload();
    }
    if !context.close(Duration::from_secs(5)) {
        warn!("Computer thread did not stop cleanly");
    }

    let metrics = context.scheduler().metrics();
    println!(
        "{}",
        serde_json::to_string_pretty(&metrics).context("Failed to serialize metrics")?
    );
    Ok(())
}
