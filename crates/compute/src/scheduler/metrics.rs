use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics, keyed by computer ID where per-computer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Units of work executed per computer.
    pub tasks_executed: HashMap<u32, u64>,
    /// Average duration of one unit of work per computer.
    pub avg_task_duration: HashMap<u32, Duration>,
    /// Last time each computer was dispatched.
    pub last_run: HashMap<u32, DateTime<Utc>>,
    /// Share of workers busy when the snapshot was taken (0.0 - 1.0).
    pub worker_utilization: f64,
    /// Executors waiting for a worker.
    pub queue_depth: usize,
    /// Computers killed by the monitor for not yielding.
    pub hard_aborts: u64,
    /// Worker threads abandoned and replaced by the monitor.
    pub replaced_workers: u64,
    /// Tasks run by the main-thread scheduler.
    pub main_tasks_executed: u64,
    /// Main-thread ticks skipped because the global budget was overdrawn.
    pub skipped_ticks: u64,
}

impl SchedulerMetrics {
    /// Record one unit of work for a computer.
    pub fn record_execution(&mut self, computer: u32, duration: Duration) {
        *self.tasks_executed.entry(computer).or_default() += 1;
        self.last_run.insert(computer, Utc::now());

        let count = self.tasks_executed[&computer];
        let prev_avg = self
            .avg_task_duration
            .get(&computer)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(computer, new_avg);
    }

    /// Total units of work across every computer.
    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(3, Duration::from_millis(100));

        assert_eq!(m.tasks_executed[&3], 1);
        assert!(m.last_run.contains_key(&3));
        assert_eq!(m.avg_task_duration[&3], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(1, Duration::from_millis(100));
        m.record_execution(1, Duration::from_millis(200));
        m.record_execution(2, Duration::from_millis(10));

        assert_eq!(m.tasks_executed[&1], 2);
        assert_eq!(m.total_executed(), 3);
        let avg = m.avg_task_duration[&1].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn default_metrics() {
        let m = SchedulerMetrics::default();
        assert_eq!(m.queue_depth, 0);
        assert_eq!(m.worker_utilization, 0.0);
        assert_eq!(m.hard_aborts, 0);
        assert!(m.tasks_executed.is_empty());
    }

    #[test]
    fn serializes_to_json() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(5, Duration::from_millis(1));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["tasks_executed"]["5"], 1);
    }
}
