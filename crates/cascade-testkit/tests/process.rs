#![cfg(unix)]

use std::time::Duration;

use cascade_runner::{Runner, RunnerOptions, RunnerState};
use serde_json::json;

fn options() -> RunnerOptions {
    RunnerOptions {
        heartbeat_timeout_ms: 2000,
        startup_timeout_ms: 10_000,
        stop_timeout_ms: 2000,
        ..RunnerOptions::default()
    }
}

#[test]
fn executable_session_runs_in_its_own_process() {
    let runner = Runner::executable(env!("CARGO_BIN_EXE_cascade-fake-composition"), options())
        .expect("build runner");
    runner.start_paused().expect("start");
    assert_eq!(runner.state(), RunnerState::Paused);
    let pid = runner.composition_pid().expect("pid");
    assert_ne!(pid, std::process::id());

    let names = runner
        .published_input_ports()
        .expect("inputs")
        .iter()
        .map(|port| port.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, ["a", "b"]);

    runner
        .set_published_input_port_values([("a", json!(20)), ("b", json!(22))])
        .expect("set");
    runner.unpause().expect("unpause");
    runner.fire_published_input_port_event("a").expect("fire");
    assert!(runner.wait_for_fired_published_input_port_event_timeout(Duration::from_secs(5)));
    assert_eq!(
        runner.published_output_port_value("sum").expect("sum"),
        Some(json!(42))
    );

    runner.stop();
    assert!(runner.is_stopped());
    assert!(!runner.has_lost_contact());
    assert_eq!(runner.composition_pid(), None);
}

#[test]
fn missing_executable_fails_to_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner =
        Runner::executable(dir.path().join("no-such-composition"), options()).expect("build");
    let err = runner.start().expect_err("missing executable");
    assert!(err.to_string().contains("no-such-composition") || err.to_string().contains("exec"));
    assert!(runner.is_stopped());
}
