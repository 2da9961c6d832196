use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Everything the scheduling core needs to know, typically parsed from TOML
/// or assembled from `CC_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputerConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub main_thread: MainThreadConfig,
    #[serde(default)]
    pub computer: ComputerLimits,
}

impl ComputerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CC_PROFILE`. When set (e.g. `PROD`), every key is
    /// first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            scheduler: SchedulerConfig::from_env_profiled(p),
            timeout: TimeoutConfig::from_env_profiled(p),
            main_thread: MainThreadConfig::from_env_profiled(p),
            computer: ComputerLimits::from_env_profiled(p),
        }
    }

    /// Parse a TOML document. Missing sections and keys fall back to defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, CoreError> {
        toml::from_str(source).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Load a TOML config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   threads={}, latency={}ms, min_period={}ms, monitor={}ms",
            self.scheduler.resolved_computer_threads(),
            self.scheduler.latency_ms,
            self.scheduler.min_period_ms,
            self.scheduler.monitor_wakeup_ms
        );
        tracing::info!(
            "  timeout:     soft={}ms, abort={}ms",
            self.timeout.soft_timeout_ms,
            self.timeout.abort_timeout_ms
        );
        tracing::info!(
            "  main thread: global={}ms, computer={}ms, task_limit={}",
            self.main_thread.max_main_global_time_ms,
            self.main_thread.max_main_computer_time_ms,
            self.main_thread.task_limit
        );
        tracing::info!(
            "  computer:    event_limit={}, start_delay={} ticks",
            self.computer.event_queue_limit,
            self.computer.start_delay_ticks
        );
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Compute scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_computer_threads")]
    pub computer_threads: usize,
    /// Target latency between two dispatches of the same computer, before scaling.
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// Lower bound of the scaled period, before scaling.
    #[serde(default = "default_min_period")]
    pub min_period_ms: u64,
    /// How often the monitor checks running computers when the pool is not busy.
    #[serde(default = "default_monitor_wakeup")]
    pub monitor_wakeup_ms: u64,
    /// Requeued computers get `latency / sleep_credit_divisor` knocked off their
    /// virtual runtime. 0 disables the credit.
    #[serde(default = "default_sleep_credit_divisor")]
    pub sleep_credit_divisor: u64,
    /// Charge never-run computers one scaled period on their first enqueue.
    #[serde(default = "default_penalize_new")]
    pub penalize_new_executors: bool,
}

fn default_computer_threads() -> usize { 1 }
fn default_latency() -> u64 { 50 }
fn default_min_period() -> u64 { 5 }
fn default_monitor_wakeup() -> u64 { 100 }
fn default_sleep_credit_divisor() -> u64 { 2 }
fn default_penalize_new() -> bool { true }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            computer_threads: default_computer_threads(),
            latency_ms: default_latency(),
            min_period_ms: default_min_period(),
            monitor_wakeup_ms: default_monitor_wakeup(),
            sleep_credit_divisor: default_sleep_credit_divisor(),
            penalize_new_executors: default_penalize_new(),
        }
    }
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            computer_threads: profiled_env_parse(p, "CC_COMPUTER_THREADS", default_computer_threads()),
            latency_ms: profiled_env_parse(p, "CC_LATENCY_MS", default_latency()),
            min_period_ms: profiled_env_parse(p, "CC_MIN_PERIOD_MS", default_min_period()),
            monitor_wakeup_ms: profiled_env_parse(p, "CC_MONITOR_WAKEUP_MS", default_monitor_wakeup()),
            sleep_credit_divisor: profiled_env_parse(
                p,
                "CC_SLEEP_CREDIT_DIVISOR",
                default_sleep_credit_divisor(),
            ),
            penalize_new_executors: profiled_env_bool(p, "CC_PENALIZE_NEW", default_penalize_new()),
        }
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_computer_threads(&self) -> usize {
        if self.computer_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.computer_threads
        }
    }

    /// `1 + floor(log2(threads))`: more workers tolerate proportionally longer slices.
    pub fn latency_factor(&self) -> u32 {
        let threads = self.resolved_computer_threads().max(1) as u64;
        64 - threads.leading_zeros()
    }

    pub fn scaled_latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms) * self.latency_factor()
    }

    pub fn scaled_min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms) * self.latency_factor()
    }

    pub fn monitor_wakeup(&self) -> Duration {
        Duration::from_millis(self.monitor_wakeup_ms)
    }
}

// ── Timeouts ──────────────────────────────────────────────────

/// Soft/hard abort thresholds for a single computer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Cumulative execution time after which the computer is asked to yield.
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_ms: u64,
    /// Grace period after the soft abort before the machine is destroyed. The
    /// same window again (twice) is allowed before the worker itself is replaced.
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_ms: u64,
}

fn default_soft_timeout() -> u64 { 7000 }
fn default_abort_timeout() -> u64 { 1500 }

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            soft_timeout_ms: default_soft_timeout(),
            abort_timeout_ms: default_abort_timeout(),
        }
    }
}

impl TimeoutConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            soft_timeout_ms: profiled_env_parse(p, "CC_SOFT_TIMEOUT_MS", default_soft_timeout()),
            abort_timeout_ms: profiled_env_parse(p, "CC_ABORT_TIMEOUT_MS", default_abort_timeout()),
        }
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

// ── Main thread ───────────────────────────────────────────────

/// Budgets for work which must run on the host's main simulation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainThreadConfig {
    /// Time all computers may spend on the main thread per tick.
    #[serde(default = "default_max_main_global")]
    pub max_main_global_time_ms: u64,
    /// Time a single computer may spend on the main thread per tick.
    #[serde(default = "default_max_main_computer")]
    pub max_main_computer_time_ms: u64,
    /// Maximum number of queued main-thread tasks per computer.
    #[serde(default = "default_task_limit")]
    pub task_limit: usize,
}

fn default_max_main_global() -> u64 { 10 }
fn default_max_main_computer() -> u64 { 5 }
fn default_task_limit() -> usize { 5000 }

impl Default for MainThreadConfig {
    fn default() -> Self {
        Self {
            max_main_global_time_ms: default_max_main_global(),
            max_main_computer_time_ms: default_max_main_computer(),
            task_limit: default_task_limit(),
        }
    }
}

impl MainThreadConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_main_global_time_ms: profiled_env_parse(p, "CC_MAX_MAIN_GLOBAL_MS", default_max_main_global()),
            max_main_computer_time_ms: profiled_env_parse(
                p,
                "CC_MAX_MAIN_COMPUTER_MS",
                default_max_main_computer(),
            ),
            task_limit: profiled_env_parse(p, "CC_MAIN_TASK_LIMIT", default_task_limit()),
        }
    }

    pub fn max_global_time(&self) -> Duration {
        Duration::from_millis(self.max_main_global_time_ms)
    }

    pub fn max_computer_time(&self) -> Duration {
        Duration::from_millis(self.max_main_computer_time_ms)
    }
}

// ── Per-computer limits ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerLimits {
    /// Events beyond this many pending are dropped.
    #[serde(default = "default_event_queue_limit")]
    pub event_queue_limit: usize,
    /// Minimum ticks between two consecutive turn-ons of the same computer.
    #[serde(default = "default_start_delay")]
    pub start_delay_ticks: u32,
}

fn default_event_queue_limit() -> usize { 256 }
fn default_start_delay() -> u32 { 50 }

impl Default for ComputerLimits {
    fn default() -> Self {
        Self {
            event_queue_limit: default_event_queue_limit(),
            start_delay_ticks: default_start_delay(),
        }
    }
}

impl ComputerLimits {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            event_queue_limit: profiled_env_parse(p, "CC_EVENT_QUEUE_LIMIT", default_event_queue_limit()),
            start_delay_ticks: profiled_env_parse(p, "CC_START_DELAY_TICKS", default_start_delay()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = ComputerConfig::default();
        assert_eq!(config.scheduler.computer_threads, 1);
        assert_eq!(config.scheduler.latency_ms, 50);
        assert_eq!(config.scheduler.min_period_ms, 5);
        assert_eq!(config.scheduler.monitor_wakeup_ms, 100);
        assert_eq!(config.scheduler.sleep_credit_divisor, 2);
        assert!(config.scheduler.penalize_new_executors);
        assert_eq!(config.timeout.soft_timeout(), Duration::from_millis(7000));
        assert_eq!(config.timeout.abort_timeout(), Duration::from_millis(1500));
        assert_eq!(config.main_thread.task_limit, 5000);
        assert_eq!(config.computer.event_queue_limit, 256);
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn latency_scales_with_log2_threads() {
        let mut config = SchedulerConfig::default();
        config.computer_threads = 1;
        assert_eq!(config.latency_factor(), 1);
        assert_eq!(config.scaled_latency(), Duration::from_millis(50));

        config.computer_threads = 2;
        assert_eq!(config.latency_factor(), 2);

        config.computer_threads = 3;
        assert_eq!(config.latency_factor(), 2);

        config.computer_threads = 4;
        assert_eq!(config.latency_factor(), 3);
        assert_eq!(config.scaled_min_period(), Duration::from_millis(15));
    }

    #[test]
    fn resolved_threads_auto_detects() {
        let mut config = SchedulerConfig::default();
        config.computer_threads = 0;
        assert!(config.resolved_computer_threads() > 0);

        config.computer_threads = 8;
        assert_eq!(config.resolved_computer_threads(), 8);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = ComputerConfig::from_toml_str(
            r#"
            [scheduler]
            computer_threads = 4

            [timeout]
            soft_timeout_ms = 200
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.computer_threads, 4);
        assert_eq!(config.scheduler.latency_ms, 50);
        assert_eq!(config.timeout.soft_timeout_ms, 200);
        assert_eq!(config.timeout.abort_timeout_ms, 1500);
        assert_eq!(config.main_thread.max_main_computer_time_ms, 5);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = ComputerConfig::from_toml_str("[scheduler]\ncomputer_threads = \"many\"").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn profiled_env_prefers_prefixed_key() {
        // Unique key names so parallel tests can't interfere.
        env::set_var("CCTEST_CC_COMPUTER_THREADS", "6");
        env::set_var("CC_LATENCY_MS", "40");
        let config = SchedulerConfig::from_env_profiled("CCTEST");
        assert_eq!(config.computer_threads, 6);
        assert_eq!(config.latency_ms, 40);
        env::remove_var("CCTEST_CC_COMPUTER_THREADS");
        env::remove_var("CC_LATENCY_MS");
    }
}
