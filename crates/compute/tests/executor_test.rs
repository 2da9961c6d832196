//! Integration tests for a single computer's executor driven by a real
//! scheduler: event ordering, backpressure and lifecycle transitions.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use cc_compute::{StateCommand, Worker};
use cc_core::Event;
use serde_json::json;

use common::{config, wait_until, Host};

#[test]
fn redstone_scenario_boots_runs_and_shuts_down() {
    let host = Host::new(&config(1));
    let (executor, recording, api) = host.executor(1);
    assert!(!executor.is_on());

    executor.queue_start();
    assert!(wait_until(|| executor.is_on() && recording.count("resume") == 1));
    assert_eq!(recording.boots.load(Ordering::SeqCst), 1);
    assert_eq!(api.startups.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        assert!(executor.queue_event(Event::named("redstone")));
    }
    assert!(wait_until(|| recording.count("redstone") == 3));
    assert_eq!(recording.events(), ["resume", "redstone", "redstone", "redstone"]);

    executor.queue_stop(false, false);
    assert!(wait_until(|| !executor.is_on()));
    assert!(wait_until(|| executor.with_filesystem(|_| ()).is_none()));
    assert_eq!(recording.closes.load(Ordering::SeqCst), 1);
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn events_arrive_in_order_around_a_pause() {
    let host = Host::new(&config(2));
    let (executor, recording, _api) = host.boot(1);

    for name in ["e1", "pause", "e2", "e3"] {
        assert!(executor.queue_event(Event::named(name)));
    }
    assert!(wait_until(|| recording.events().len() == 6));
    assert_eq!(recording.events(), ["resume", "e1", "pause", "resume", "e2", "e3"]);
}

#[test]
fn event_queue_is_capped() {
    let host = Host::new(&config(1));
    let (executor, recording, _api) = host.boot(1);

    // Park the machine so nothing drains while we fill the queue.
    assert!(executor.queue_event(Event::named("block")));
    assert!(wait_until(|| recording.count("block") == 1));

    let accepted = (0..300)
        .filter(|i| executor.queue_event(Event::new("key", vec![json!(i)])))
        .count();
    assert_eq!(accepted, 256);
    assert_eq!(executor.queued_events(), 256);

    recording.gate.open();
    assert!(wait_until(|| recording.count("key") == 256));
    assert_eq!(executor.queued_events(), 0);
}

#[test]
fn dropped_events_keep_their_order() {
    let host = Host::new(&config(1));
    let (executor, recording, _api) = host.boot(1);

    assert!(executor.queue_event(Event::named("block")));
    assert!(wait_until(|| recording.count("block") == 1));
    for i in 0..260 {
        executor.queue_event(Event::named(format!("e{}", i)));
    }
    recording.gate.open();

    assert!(wait_until(|| recording.events().len() == 2 + 256));
    let expected: Vec<String> = (0..256).map(|i| format!("e{}", i)).collect();
    assert_eq!(recording.events()[2..], expected[..]);
}

#[test]
fn repeated_stop_tears_down_once() {
    let host = Host::new(&config(2));
    let (executor, recording, api) = host.boot(1);

    executor.queue_stop(false, false);
    executor.queue_stop(false, false);
    assert!(wait_until(|| !executor.is_on()));
    executor.queue_stop(false, false);

    assert!(wait_until(|| executor.pending_command().is_none()));
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(recording.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn abort_racing_shutdown_tears_down_once() {
    let host = Host::new(&config(2));
    let (executor, recording, api) = host.boot(1);

    let stopper = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || executor.queue_stop(false, false))
    };
    executor.abort_with_timeout();
    stopper.join().unwrap();

    assert!(wait_until(|| !executor.is_on() && executor.pending_command().is_none()));
    assert!(wait_until(|| executor.with_filesystem(|_| ()).is_none()));
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(api.startups.load(Ordering::SeqCst), 1);
    assert_eq!(recording.boots.load(Ordering::SeqCst), 1);
}

#[test]
fn start_then_stop_before_dispatch_runs_one_transition() {
    let host = Host::new(&config(1));
    let (executor, recording, api) = host.executor(1);

    // Keep the worker busy so both requests land before either runs.
    let (busy, busy_recording, _) = host.boot(2);
    assert!(busy.queue_event(Event::named("block")));
    assert!(wait_until(|| busy_recording.count("block") == 1));

    executor.queue_start();
    executor.queue_stop(false, false);
    assert_eq!(executor.pending_command(), Some(StateCommand::TurnOn));

    busy_recording.gate.open();
    assert!(wait_until(|| executor.is_on() && executor.pending_command().is_none()));
    assert_eq!(recording.boots.load(Ordering::SeqCst), 1);
    assert_eq!(api.startups.load(Ordering::SeqCst), 1);
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 0);
}

#[test]
fn script_error_is_shown_and_computer_stops() {
    let host = Host::new(&config(1));
    let (executor, recording, api) = host.boot(1);

    assert!(executor.queue_event(Event::named("fail")));
    assert!(wait_until(|| !executor.is_on()));
    let screen = executor.environment().terminal().visible_text();
    assert_eq!(screen[0], "Error running computer");
    assert_eq!(screen[1], "script error");
    assert_eq!(screen[2], "ComputerCraft may be installed incorrectly");
    assert!(wait_until(|| api.shutdowns.load(Ordering::SeqCst) == 1));
    assert_eq!(recording.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn reboot_restarts_the_machine() {
    let host = Host::new(&config(1));
    let (executor, recording, api) = host.boot(1);

    executor.queue_stop(true, false);
    assert!(wait_until(|| api.shutdowns.load(Ordering::SeqCst) == 1));
    assert!(!executor.is_on());
    // A reboot asks the host to start the computer again on its next tick.
    assert!(executor.environment().start_requested());

    executor.queue_start();
    assert!(wait_until(|| executor.is_on() && recording.boots.load(Ordering::SeqCst) == 2));
    assert_eq!(api.startups.load(Ordering::SeqCst), 2);
}

#[test]
fn closed_executor_refuses_everything() {
    let host = Host::new(&config(1));
    let (executor, _recording, api) = host.boot(1);

    executor.queue_stop(false, true);
    assert!(wait_until(|| !executor.is_on()));
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);

    executor.queue_start();
    assert!(executor.pending_command().is_none());
    assert!(!executor.queue_event(Event::named("late")));
}

#[test]
fn worker_identifies_its_computer() {
    let host = Host::new(&config(1));
    let (executor, _recording, _api) = host.executor(42);
    assert_eq!(executor.computer_id(), 42);
}
