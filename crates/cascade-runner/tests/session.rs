use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use cascade_protocol::ControlRequestTag;
use cascade_runner::{
    Error, EventLoop, LaunchMode, LibrarySpec, MainJob, Runner, RunnerDelegate, RunnerOptions,
    RunnerState,
};
use cascade_testkit::{FakeHost, FakeOptions, Launched};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Clone, Default)]
struct Recorder {
    lost: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    outputs: Arc<Mutex<Vec<(String, String)>>>,
}

impl RunnerDelegate for Recorder {
    fn published_output_port_updated(&mut self, port: &str, _sent_data: bool, summary: &str) {
        self.outputs.lock().push((port.to_string(), summary.to_string()));
    }

    fn event_finished(&mut self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn lost_contact(&mut self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
}

fn options() -> RunnerOptions {
    RunnerOptions {
        heartbeat_timeout_ms: 500,
        startup_timeout_ms: 5000,
        stop_timeout_ms: 1000,
        tolerate_host_sleep: false,
        tolerate_debugger: false,
        ..RunnerOptions::default()
    }
}

fn session(fake: FakeOptions) -> (Runner, FakeHost, Recorder) {
    session_with(fake, options())
}

fn session_with(fake: FakeOptions, options: RunnerOptions) -> (Runner, FakeHost, Recorder) {
    let host = FakeHost::new(fake);
    let runner = Runner::builder(LaunchMode::Executable {
        executable: "fake-composition".into(),
    })
    .options(options)
    .host(Arc::new(host.clone()))
    .build()
    .expect("build runner");
    let recorder = Recorder::default();
    runner.set_delegate(Some(Box::new(recorder.clone())));
    (runner, host, recorder)
}

fn launched(host: &FakeHost) -> Launched {
    host.latest().expect("a composition was launched")
}

fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn batch_set_and_fire_computes_the_output() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start_paused().expect("start");
    assert_eq!(runner.state(), RunnerState::Paused);
    let composition = launched(&host).composition();
    assert!(composition.is_paused());
    assert!(composition.heartbeat_is_slow());

    runner
        .set_published_input_port_values([("a", json!(2)), ("b", json!(3))])
        .expect("set inputs");
    runner.unpause().expect("unpause");
    runner
        .fire_published_input_port_events(["a", "b"])
        .expect("fire");
    runner.wait_for_fired_published_input_port_event();

    assert_eq!(
        runner.published_output_port_value("sum").expect("sum"),
        Some(json!(5))
    );
    assert_eq!(
        composition.request_count(ControlRequestTag::PublishedInputPortValueModify),
        1
    );
    assert_eq!(
        composition.request_count(ControlRequestTag::PublishedInputPortFireEvent),
        1
    );
    assert_eq!(host.launched().len(), 1);
    eventually("the output update", || {
        recorder
            .outputs
            .lock()
            .contains(&("sum".to_string(), "5".to_string()))
    });
    runner.stop();
}

#[test]
fn fired_events_saturate() {
    let (runner, _host, recorder) = session(FakeOptions {
        event_delay: Duration::from_millis(100),
        ..FakeOptions::default()
    });
    runner.start().expect("start");

    runner.fire_published_input_port_event("a").expect("fire");
    runner.fire_published_input_port_event("a").expect("fire");
    assert!(runner.wait_for_fired_published_input_port_event_timeout(Duration::from_secs(5)));
    // Both events finished after the second fire; the signal was consumed once.
    eventually("both events", || recorder.finished.load(Ordering::SeqCst) == 2);
    assert!(!runner.wait_for_fired_published_input_port_event_timeout(Duration::from_millis(200)));
    runner.stop();
}

#[test]
fn published_ports_are_discovered_once() {
    let (runner, host, _recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    let composition = launched(&host).composition();

    let first = runner.published_input_ports().expect("inputs");
    let second = runner.published_input_ports().expect("inputs");
    assert_eq!(first.len(), 2);
    assert!(Arc::ptr_eq(&first[0], &second[0]));
    assert_eq!(
        composition.request_count(ControlRequestTag::PublishedInputPortNamesRetrieve),
        1
    );
    assert_eq!(
        composition.request_count(ControlRequestTag::PublishedOutputPortNamesRetrieve),
        0
    );

    let a = runner
        .published_input_port("a")
        .expect("lookup")
        .expect("port a");
    assert_eq!(a.type_name(), "integer");
    assert_eq!(a.suggested_max(), Some(&json!(100)));
    assert!(runner.published_input_port("missing").expect("lookup").is_none());
    let outputs = runner.published_output_ports().expect("outputs");
    assert_eq!(outputs[0].name(), "sum");

    runner.stop();
    assert!(runner.published_input_ports().expect("inputs").is_empty());
}

#[test]
fn stop_is_idempotent_and_final() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    let composition = launched(&host).composition();

    runner.stop();
    runner.stop();
    assert!(composition.wait_for_stop(Duration::from_secs(1)));
    assert!(runner.is_stopped());
    assert!(!runner.has_lost_contact());
    runner.wait_until_stopped();

    assert!(matches!(runner.start(), Err(Error::InvalidInput { .. })));
    assert_eq!(runner.input_port_value("x").expect("no-op"), None);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.lost.load(Ordering::SeqCst), 0);
}

#[test]
fn wrong_reply_is_a_protocol_fault_and_loses_contact() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    launched(&host)
        .composition()
        .inject_wrong_reply(ControlRequestTag::OutputPortSummaryRetrieve);

    let err = runner.output_port_summary("node:out").expect_err("wrong tag");
    assert!(matches!(err, Error::ProtocolFault { .. }), "{err:?}");
    assert!(runner.has_lost_contact());
    runner.wait_until_stopped();
    eventually("the lost contact notice", || {
        recorder.lost.load(Ordering::SeqCst) == 1
    });
}

#[test]
fn dropped_connection_during_discovery_loses_contact() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    launched(&host)
        .composition()
        .hang_up_on(ControlRequestTag::PublishedInputPortNamesRetrieve);

    let err = runner.published_input_ports().expect_err("hung up");
    assert!(matches!(err, Error::Transport { .. }), "{err:?}");
    runner.wait_until_stopped();
    assert!(runner.has_lost_contact());
    // Later operations on the lost session are no-ops.
    assert!(runner.published_input_ports().expect("inputs").is_empty());
    eventually("the lost contact notice", || {
        recorder.lost.load(Ordering::SeqCst) == 1
    });
}

#[test]
fn discovery_timeout_loses_contact() {
    let (runner, host, recorder) = session_with(
        FakeOptions::default(),
        RunnerOptions {
            discovery_timeout_ms: 200,
            ..options()
        },
    );
    runner.start().expect("start");
    launched(&host)
        .composition()
        .stall_on(ControlRequestTag::PublishedInputPortNamesRetrieve);

    let err = runner.published_input_ports().expect_err("stalled");
    assert!(matches!(err, Error::Timeout { timeout_ms: 200, .. }), "{err:?}");
    runner.wait_until_stopped();
    assert!(runner.has_lost_contact());
    eventually("the lost contact notice", || {
        recorder.lost.load(Ordering::SeqCst) == 1
    });
}

fn assert_start_fails_quietly(runner: &Runner, recorder: &Recorder) {
    let err = runner.start().expect_err("start fails");
    assert!(matches!(err, Error::StartFailure { .. }), "{err:?}");
    assert!(runner.is_stopped());
    assert!(!runner.has_lost_contact());
    runner.wait_until_stopped();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.lost.load(Ordering::SeqCst), 0);
}

#[test]
fn hang_up_during_handshake_is_a_start_failure() {
    let (runner, host, recorder) = session(FakeOptions {
        hang_up_on: Some(ControlRequestTag::SlowHeartbeat),
        ..FakeOptions::default()
    });
    assert_start_fails_quietly(&runner, &recorder);
    assert_eq!(
        launched(&host)
            .composition()
            .request_count(ControlRequestTag::SlowHeartbeat),
        1
    );
}

#[test]
fn stalled_handshake_is_a_start_failure() {
    let (runner, _host, recorder) = session_with(
        FakeOptions {
            stall_on: Some(ControlRequestTag::SlowHeartbeat),
            ..FakeOptions::default()
        },
        RunnerOptions {
            startup_timeout_ms: 300,
            ..options()
        },
    );
    assert_start_fails_quietly(&runner, &recorder);
}

#[test]
fn silent_composition_is_a_start_failure() {
    let (runner, _host, recorder) = session_with(
        FakeOptions {
            silent: true,
            ..FakeOptions::default()
        },
        RunnerOptions {
            startup_timeout_ms: 300,
            ..options()
        },
    );
    assert_start_fails_quietly(&runner, &recorder);
}

#[test]
fn fire_all_uses_every_published_input() {
    let (runner, host, _recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    runner
        .set_published_input_port_values([("a", json!(4)), ("b", json!(5))])
        .expect("set inputs");

    runner.fire_all_published_input_port_events().expect("fire all");
    runner.wait_for_fired_published_input_port_event();
    assert_eq!(
        runner.published_output_port_value("sum").expect("sum"),
        Some(json!(9))
    );

    let none: [&str; 0] = [];
    assert!(matches!(
        runner.fire_published_input_port_events(none),
        Err(Error::InvalidInput { .. })
    ));
    assert_eq!(
        launched(&host)
            .composition()
            .request_count(ControlRequestTag::PublishedInputPortFireEvent),
        1
    );
    runner.stop();
}

#[test]
fn lost_contact_is_reported_once() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    let launched = launched(&host);

    let pollers = (0..4)
        .map(|_| {
            let runner = runner.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let _ = runner.published_output_port_value("sum");
                }
            })
        })
        .collect::<Vec<_>>();
    launched.crash();
    for poller in pollers {
        poller.join().expect("poller");
    }

    runner.wait_until_stopped();
    assert!(runner.has_lost_contact());
    assert!(runner.is_stopped());
    eventually("the lost contact notice", || {
        recorder.lost.load(Ordering::SeqCst) >= 1
    });
    thread::sleep(Duration::from_millis(200));
    assert_eq!(recorder.lost.load(Ordering::SeqCst), 1);
}

#[test]
fn telemetry_silence_loses_contact() {
    let (runner, host, recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    launched(&host).composition().go_silent();

    runner.wait_until_stopped();
    assert!(runner.has_lost_contact());
    eventually("the lost contact notice", || {
        recorder.lost.load(Ordering::SeqCst) == 1
    });
}

#[test]
fn composition_can_ask_to_stop() {
    let (runner, host, _recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    launched(&host).composition().request_stop();

    runner.wait_until_stopped();
    assert!(runner.is_stopped());
}

#[test]
fn internal_ports_round_trip_json() {
    let (runner, host, _recorder) = session(FakeOptions::default());
    runner.start().expect("start");

    runner
        .set_input_port_value("node:in", &json!({"x": [1, 2]}))
        .expect("set");
    assert_eq!(
        runner.input_port_value("node:in").expect("value"),
        Some(json!({"x": [1, 2]}))
    );
    assert_eq!(runner.output_port_value("node:other").expect("value"), None);
    assert_eq!(
        runner
            .subscribe_to_input_port_telemetry("top", "node:in")
            .expect("subscribe")
            .as_deref(),
        Some(r#"{"x":[1,2]}"#)
    );
    runner.fire_trigger_port_event("node:trigger").expect("fire");
    let composition = launched(&host).composition();
    assert_eq!(
        composition.request_count(ControlRequestTag::TriggerPortFireEvent),
        1
    );
    runner.stop();
}

fn loader_session(host: &FakeHost) -> Runner {
    Runner::builder(LaunchMode::Loader {
        loader: "cascade-loader".into(),
        module: "first.so".into(),
    })
    .options(options())
    .host(Arc::new(host.clone()))
    .build()
    .expect("build runner")
}

#[test]
fn loader_sessions_replace_the_composition() {
    let host = FakeHost::new(FakeOptions::default());
    let runner = loader_session(&host);
    runner.start().expect("start");
    assert_eq!(runner.published_input_ports().expect("inputs").len(), 2);

    let queued = runner
        .update_libraries(|libraries| {
            libraries.enqueue_resource_library_to_load(LibrarySpec::new("libextra.so"))
        })
        .expect("enqueue");
    assert!(queued);
    runner
        .replace_composition("second.so", Some("added a node"))
        .expect("replace");
    assert_eq!(runner.state(), RunnerState::Running);
    assert!(!launched(&host).composition().is_paused());

    let requests = host.replacements();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].module_path, "first.so");
    assert_eq!(requests[1].module_path, "second.so");
    assert_eq!(requests[1].change_description.as_deref(), Some("added a node"));
    assert_eq!(requests[1].load, vec!["libextra.so".to_string()]);

    // The new composition answers discovery again.
    assert_eq!(runner.published_input_ports().expect("inputs").len(), 2);
    assert_eq!(
        launched(&host)
            .composition()
            .request_count(ControlRequestTag::PublishedInputPortNamesRetrieve),
        1
    );
    runner.stop();
}

#[test]
fn refused_replacement_loses_contact() {
    let host = FakeHost::new(FakeOptions::default());
    let runner = loader_session(&host);
    runner.start().expect("start");
    host.refuse_replacements();

    let err = runner
        .replace_composition("broken.so", None)
        .expect_err("refused");
    assert!(matches!(err, Error::ReplaceFailed { .. }), "{err:?}");
    runner.wait_until_stopped();
    assert!(runner.has_lost_contact());
}

#[test]
fn only_loader_sessions_replace() {
    let (runner, _host, _recorder) = session(FakeOptions::default());
    runner.start().expect("start");
    assert!(matches!(
        runner.replace_composition("other.so", None),
        Err(Error::Unsupported { .. })
    ));
    runner.stop();
}

/// An event loop serviced by the thread that created it.
struct OwnedLoop {
    owner: ThreadId,
    jobs: Mutex<Vec<MainJob>>,
    ran: AtomicUsize,
}

impl OwnedLoop {
    fn new() -> Self {
        Self {
            owner: thread::current().id(),
            jobs: Mutex::new(Vec::new()),
            ran: AtomicUsize::new(0),
        }
    }

    fn post(&self, job: impl FnOnce() + Send + 'static) {
        self.jobs.lock().push(Box::new(job));
    }
}

impl EventLoop for OwnedLoop {
    fn drain(&self, timeout: Duration) -> usize {
        assert_eq!(thread::current().id(), self.owner, "drained off the loop thread");
        let jobs = std::mem::take(&mut *self.jobs.lock());
        if jobs.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        let count = jobs.len();
        for job in jobs {
            job();
        }
        self.ran.fetch_add(count, Ordering::SeqCst);
        count
    }

    fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

#[test]
fn in_process_waits_keep_the_event_loop_running() {
    let host = FakeHost::new(FakeOptions {
        event_delay: Duration::from_millis(200),
        ..FakeOptions::default()
    });
    let event_loop = Arc::new(OwnedLoop::new());
    let runner = Runner::builder(LaunchMode::Module {
        module: "composition.so".into(),
    })
    .options(options())
    .host(Arc::new(host.clone()))
    .event_loop(event_loop.clone())
    .build()
    .expect("build runner");
    runner.start().expect("start");
    assert!(launched(&host).is_in_process());

    runner.fire_published_input_port_event("a").expect("fire");
    let poster = {
        let event_loop = Arc::clone(&event_loop);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            event_loop.post(|| {});
        })
    };
    runner.wait_for_fired_published_input_port_event();
    poster.join().expect("poster");
    assert_eq!(event_loop.ran.load(Ordering::SeqCst), 1);

    event_loop.post(|| {});
    assert_eq!(runner.published_input_ports().expect("inputs").len(), 2);
    runner.stop();
    runner.wait_until_stopped();
    assert_eq!(event_loop.ran.load(Ordering::SeqCst), 2);
}
