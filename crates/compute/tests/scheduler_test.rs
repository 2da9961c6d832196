//! Integration tests for the compute scheduler with real executors: fair
//! sharing between busy computers, timeout escalation and worker replacement.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cc_core::{ComputerConfig, Event};

use common::{config, wait_until, Host};

fn short_timeouts() -> ComputerConfig {
    let mut config = config(1);
    config.timeout.soft_timeout_ms = 200;
    config.timeout.abort_timeout_ms = 100;
    config
}

#[test]
fn busy_computers_all_get_dispatched() {
    let host = Host::new(&config(1));
    let computers: Vec<_> = (1..=4).map(|id| host.boot(id)).collect();

    let start = Instant::now();
    for (executor, _, _) in &computers {
        assert!(executor.queue_event(Event::named("spin")));
    }

    // None of these ever finish, so they can only progress by being paused.
    assert!(wait_until(|| computers.iter().all(|(_, r, _)| r.count("spin") == 1)));
    assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

    assert!(wait_until(|| computers.iter().all(|(_, r, _)| r.count("resume") >= 3)));
}

#[test]
fn computer_never_runs_on_two_workers_at_once() {
    let host = Host::new(&config(4));
    let computers: Vec<_> = (1..=4).map(|id| host.boot(id)).collect();
    let executors: Vec<_> = computers.iter().map(|(e, _, _)| Arc::clone(e)).collect();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let executors = executors.clone();
            thread::spawn(move || {
                let mut accepted = vec![0usize; executors.len()];
                for _ in 0..200 {
                    for (i, executor) in executors.iter().enumerate() {
                        if executor.queue_event(Event::named("tick")) {
                            accepted[i] += 1;
                        }
                    }
                }
                accepted
            })
        })
        .collect();

    let mut accepted = vec![0usize; executors.len()];
    for producer in producers {
        for (total, count) in accepted.iter_mut().zip(producer.join().unwrap()) {
            *total += count;
        }
    }

    for ((_, recording, _), expected) in computers.iter().zip(&accepted) {
        assert!(wait_until(|| recording.count("tick") == *expected));
        assert_eq!(recording.max_active.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn unresponsive_computer_is_escalated_and_its_worker_replaced() {
    let host = Host::new(&short_timeouts());
    let (stuck, recording, api) = host.boot(1);
    let (healthy, healthy_recording, _) = host.boot(2);
    let scheduler = host.context.scheduler();

    let start = Instant::now();
    assert!(stuck.queue_event(Event::named("wedge")));
    assert!(wait_until(|| recording.count("wedge") == 1));

    // The only worker is wedged, so this must wait for a replacement.
    assert!(healthy.queue_event(Event::named("ping")));

    assert!(wait_until(|| stuck.handle().timeout().is_soft_aborted()));
    assert!(start.elapsed() >= Duration::from_millis(200));

    assert!(wait_until(|| scheduler.metrics().hard_aborts == 1));
    assert!(start.elapsed() >= Duration::from_millis(300));
    // Hard abort closes the machine from the monitor while it is still running.
    assert!(recording.closes.load(Ordering::SeqCst) >= 1);

    assert!(wait_until(|| scheduler.metrics().replaced_workers == 1));
    assert!(start.elapsed() >= Duration::from_millis(500));

    // The new worker tears the stuck computer down and serves the other one.
    assert!(wait_until(|| !stuck.is_on()));
    let screen = stuck.environment().terminal().visible_text();
    assert_eq!(screen[1], "Too long without yielding");
    assert!(wait_until(|| api.shutdowns.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| healthy_recording.count("ping") == 1));
    assert!(healthy.is_on());

    recording.release.store(true, Ordering::SeqCst);
}

#[test]
fn replacement_worker_does_not_inherit_the_overrun() {
    let host = Host::new(&short_timeouts());
    let (stuck, recording, api) = host.boot(1);
    // Tearing down takes longer than two abort windows.
    api.shutdown_delay_ms.store(250, Ordering::SeqCst);
    let scheduler = host.context.scheduler();

    assert!(stuck.queue_event(Event::named("wedge")));
    assert!(wait_until(|| scheduler.metrics().replaced_workers == 1));
    assert!(wait_until(|| api.shutdowns.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| !stuck.is_on()));

    // Plenty of monitor passes, had the shutdown been charged for the wedged run.
    thread::sleep(Duration::from_millis(500));
    let metrics = scheduler.metrics();
    assert_eq!(metrics.replaced_workers, 1);
    assert_eq!(metrics.hard_aborts, 1);
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(stuck.handle().timeout().cumulative_elapsed(), Duration::ZERO);

    recording.release.store(true, Ordering::SeqCst);
}

#[test]
fn stop_aborts_running_computers() {
    let host = Host::new(&config(2));
    let (executor, recording, _api) = host.boot(1);

    assert!(executor.queue_event(Event::named("spin")));
    assert!(wait_until(|| recording.count("spin") == 1));

    assert!(host.context.close(Duration::from_secs(2)));
    assert!(!host.context.scheduler().is_running());
    // Aborted mid-event, so the machine failed and the computer shut down.
    assert!(!executor.is_on());
    assert!(!executor.queue_event(Event::named("late")));
}

#[test]
fn metrics_track_dispatches_per_computer() {
    let host = Host::new(&config(1));
    let (executor, recording, _api) = host.boot(7);

    for _ in 0..5 {
        assert!(executor.queue_event(Event::named("tick")));
    }
    assert!(wait_until(|| recording.count("tick") == 5));

    let metrics = host.context.scheduler().metrics();
    // One turn-on, the boot resume, then an event per dispatch at most.
    assert!(metrics.tasks_executed[&7] >= 3);
    assert!(metrics.last_run.contains_key(&7));
    assert_eq!(metrics.hard_aborts, 0);
}
