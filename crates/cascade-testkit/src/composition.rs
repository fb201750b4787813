//! A composition that serves the Control and Telemetry protocols from
//! threads of the current process.
//!
//! It publishes two integer inputs `a` and `b` and one output `sum`. Firing
//! an event computes `sum = a + b`, publishes the output update and then
//! `EventFinished`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cascade_protocol::{
    ControlReplyTag, ControlRequest, ControlRequestTag, Endpoint, Message, ProtoError,
    PublishedPortUpdate, Publisher, ReplyChannel, ReplyListener, Telemetry,
};
use parking_lot::{Condvar, Mutex};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// Heartbeat period until the runner asks for slow heartbeats.
    pub fast_heartbeat: Duration,
    pub slow_heartbeat: Duration,
    /// How long a fired event takes to propagate.
    pub event_delay: Duration,
    /// Faults armed before the runner connects, for the start handshake.
    pub hang_up_on: Option<ControlRequestTag>,
    pub stall_on: Option<ControlRequestTag>,
    /// Never publishes telemetry.
    pub silent: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            fast_heartbeat: Duration::from_millis(10),
            slow_heartbeat: Duration::from_millis(200),
            event_delay: Duration::ZERO,
            hang_up_on: None,
            stall_on: None,
            silent: false,
        }
    }
}

#[derive(Default)]
struct Faults {
    wrong_reply_for: Option<ControlRequestTag>,
    hang_up_on: Option<ControlRequestTag>,
    stall_on: Option<ControlRequestTag>,
}

#[derive(Default)]
struct PortState {
    paused: bool,
    published: BTreeMap<String, Value>,
    internal: BTreeMap<String, Value>,
}

struct Shared {
    options: FakeOptions,
    publisher: Mutex<Option<Publisher>>,
    ports: Mutex<PortState>,
    counts: Mutex<HashMap<ControlRequestTag, usize>>,
    faults: Mutex<Faults>,
    slow: AtomicBool,
    silent: AtomicBool,
    shutdown: AtomicBool,
    stop_received: Mutex<bool>,
    stop_cond: Condvar,
}

/// Handle to a running fake composition. Clones share it.
#[derive(Clone)]
pub struct FakeComposition {
    shared: Arc<Shared>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FakeComposition {
    /// Binds both endpoints and starts serving. The composition starts
    /// paused, the way the runner launches it.
    pub fn serve(
        control: &Endpoint,
        telemetry: &Endpoint,
        options: FakeOptions,
    ) -> Result<Self, ProtoError> {
        let listener = ReplyListener::bind(control)?;
        let publisher = Publisher::bind(telemetry)?;
        let faults = Faults {
            wrong_reply_for: None,
            hang_up_on: options.hang_up_on,
            stall_on: options.stall_on,
        };
        let silent = options.silent;
        let shared = Arc::new(Shared {
            options,
            publisher: Mutex::new(Some(publisher)),
            ports: Mutex::new(PortState {
                paused: true,
                published: BTreeMap::from([
                    ("a".to_string(), json!(0)),
                    ("b".to_string(), json!(0)),
                    ("sum".to_string(), json!(0)),
                ]),
                internal: BTreeMap::new(),
            }),
            counts: Mutex::new(HashMap::new()),
            faults: Mutex::new(faults),
            slow: AtomicBool::new(false),
            silent: AtomicBool::new(silent),
            shutdown: AtomicBool::new(false),
            stop_received: Mutex::new(false),
            stop_cond: Condvar::new(),
        });

        let control_thread = thread::Builder::new()
            .name("fake-control".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || serve_control(&shared, &listener)
            })?;
        let heartbeat_thread = thread::Builder::new()
            .name("fake-heartbeat".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || heartbeat(&shared)
            })?;
        Ok(Self {
            shared,
            threads: Arc::new(Mutex::new(vec![control_thread, heartbeat_thread])),
        })
    }

    /// A composition that serves nothing, standing in for a loader that has
    /// not received a module yet.
    pub fn idle() -> Self {
        let shared = Arc::new(Shared {
            options: FakeOptions::default(),
            publisher: Mutex::new(None),
            ports: Mutex::new(PortState::default()),
            counts: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            slow: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            shutdown: AtomicBool::new(true),
            stop_received: Mutex::new(false),
            stop_cond: Condvar::new(),
        });
        Self {
            shared,
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of Control requests received with `tag`.
    pub fn request_count(&self, tag: ControlRequestTag) -> usize {
        self.shared.counts.lock().get(&tag).copied().unwrap_or(0)
    }

    /// The next request with `tag` is answered with a reply of another tag.
    pub fn inject_wrong_reply(&self, tag: ControlRequestTag) {
        self.shared.faults.lock().wrong_reply_for = Some(tag);
    }

    /// The next request with `tag` gets no reply; the connection closes.
    pub fn hang_up_on(&self, tag: ControlRequestTag) {
        self.shared.faults.lock().hang_up_on = Some(tag);
    }

    /// The next request with `tag` is read but never answered; the
    /// connection stays open.
    pub fn stall_on(&self, tag: ControlRequestTag) {
        self.shared.faults.lock().stall_on = Some(tag);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.ports.lock().paused
    }

    pub fn heartbeat_is_slow(&self) -> bool {
        self.shared.slow.load(Ordering::SeqCst)
    }

    /// Stops heartbeats while the connections stay open, like a composition
    /// stuck in a node.
    pub fn go_silent(&self) {
        self.shared.silent.store(true, Ordering::SeqCst);
    }

    pub fn publish(&self, telemetry: &Telemetry) {
        self.shared.publish(telemetry);
    }

    /// Asks the runner to stop the composition, as a composition that
    /// wants to quit does.
    pub fn request_stop(&self) {
        self.publish(&Telemetry::StopRequested);
    }

    /// Waits until the runner sent a stop request.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        let mut received = self.shared.stop_received.lock();
        if !*received {
            let _ = self.shared.stop_cond.wait_for(&mut received, timeout);
        }
        *received
    }

    /// Stops serving and closes the telemetry endpoint, like a crash.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.publisher.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Shared {
    fn publish(&self, telemetry: &Telemetry) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            let _ = publisher.publish(&telemetry.to_message());
        }
    }

    fn fire(self: &Arc<Self>) {
        let sum = {
            let ports = self.ports.lock();
            let a = ports.published.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = ports.published.get("b").and_then(Value::as_i64).unwrap_or(0);
            a + b
        };
        let shared = Arc::clone(self);
        let propagate = move || {
            thread::sleep(shared.options.event_delay);
            shared.ports.lock().published.insert("sum".to_string(), json!(sum));
            shared.publish(&Telemetry::PublishedOutputPortsUpdated(vec![
                PublishedPortUpdate {
                    port: "sum".to_string(),
                    sent_data: true,
                    summary: sum.to_string(),
                },
            ]));
            shared.publish(&Telemetry::EventFinished);
        };
        if self.options.event_delay.is_zero() {
            propagate();
        } else {
            let _ = thread::Builder::new()
                .name("fake-event".to_string())
                .spawn(propagate);
        }
    }
}

fn heartbeat(shared: &Shared) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        if !shared.silent.load(Ordering::SeqCst) {
            shared.publish(&Telemetry::Heartbeat);
        }
        let period = if shared.slow.load(Ordering::SeqCst) {
            shared.options.slow_heartbeat
        } else {
            shared.options.fast_heartbeat
        };
        thread::sleep(period);
    }
}

fn serve_control(shared: &Arc<Shared>, listener: &ReplyListener) {
    const POLL: Duration = Duration::from_millis(20);
    while !shared.shutdown.load(Ordering::SeqCst) {
        let mut channel = match listener.accept_timeout(POLL) {
            Ok(Some(channel)) => channel,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "fake composition accept failed");
                return;
            },
        };
        serve_connection(shared, &mut channel);
    }
}

fn serve_connection(shared: &Arc<Shared>, channel: &mut ReplyChannel) {
    const POLL: Duration = Duration::from_millis(20);
    while !shared.shutdown.load(Ordering::SeqCst) {
        let message = match channel.recv(Some(POLL)) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                tracing::debug!(error = %err, "fake composition control channel failed");
                return;
            },
        };
        let request = match ControlRequest::from_message(&message) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %err, "fake composition got a malformed request");
                return;
            },
        };
        let tag = request.tag();
        *shared.counts.lock().entry(tag).or_insert(0) += 1;

        {
            let mut faults = shared.faults.lock();
            if faults.hang_up_on == Some(tag) {
                faults.hang_up_on = None;
                return;
            }
            if faults.stall_on == Some(tag) {
                faults.stall_on = None;
                continue;
            }
            if faults.wrong_reply_for == Some(tag) {
                faults.wrong_reply_for = None;
                let wrong = if tag == ControlRequestTag::CompositionPause {
                    ControlReplyTag::CompositionUnpaused
                } else {
                    ControlReplyTag::CompositionPaused
                };
                let _ = channel.send(&Message::new(wrong));
                continue;
            }
        }

        let reply = answer(shared, &request);
        if channel.send(&reply).is_err() {
            return;
        }
        if let ControlRequest::FirePublishedInputPortEvent { .. } = request {
            shared.fire();
        }
        if let ControlRequest::Stop { .. } = request {
            *shared.stop_received.lock() = true;
            shared.stop_cond.notify_all();
        }
    }
}

type PortRow = (&'static str, &'static str, Value);

fn port_list(ports: &[PortRow], pick: impl Fn(&PortRow) -> String) -> Vec<String> {
    ports.iter().map(pick).collect()
}

fn published_inputs() -> Vec<PortRow> {
    vec![
        ("a", "integer", json!({"default": 0, "suggestedMin": 0, "suggestedMax": 100})),
        ("b", "integer", json!({"default": 0, "suggestedStep": 1})),
    ]
}

fn published_outputs() -> Vec<PortRow> {
    vec![("sum", "integer", json!({}))]
}

fn answer(shared: &Shared, request: &ControlRequest) -> Message {
    let mut reply = Message::new(request.reply_tag());
    let mut ports = shared.ports.lock();
    match request {
        ControlRequest::Pause => ports.paused = true,
        ControlRequest::Unpause => ports.paused = false,
        ControlRequest::SlowHeartbeat => shared.slow.store(true, Ordering::SeqCst),
        ControlRequest::SetInputPortValue { port, value } => {
            let value = serde_json::from_str(value).unwrap_or(Value::Null);
            ports.internal.insert(port.clone(), value);
        },
        ControlRequest::InputPortValue { port } | ControlRequest::OutputPortValue { port } => {
            reply.push(ports.internal.get(port).map(Value::to_string));
        },
        ControlRequest::InputPortSummary { port }
        | ControlRequest::OutputPortSummary { port }
        | ControlRequest::SubscribeInputPortTelemetry { port, .. }
        | ControlRequest::SubscribeOutputPortTelemetry { port, .. } => {
            let summary = ports
                .internal
                .get(port)
                .map(Value::to_string)
                .unwrap_or_default();
            reply.push(summary);
        },
        ControlRequest::PublishedInputPortNames => {
            reply.push_list(port_list(&published_inputs(), |p| p.0.to_string()));
        },
        ControlRequest::PublishedInputPortTypes => {
            reply.push_list(port_list(&published_inputs(), |p| p.1.to_string()));
        },
        ControlRequest::PublishedInputPortDetails => {
            reply.push_list(port_list(&published_inputs(), |p| p.2.to_string()));
        },
        ControlRequest::PublishedOutputPortNames => {
            reply.push_list(port_list(&published_outputs(), |p| p.0.to_string()));
        },
        ControlRequest::PublishedOutputPortTypes => {
            reply.push_list(port_list(&published_outputs(), |p| p.1.to_string()));
        },
        ControlRequest::PublishedOutputPortDetails => {
            reply.push_list(port_list(&published_outputs(), |p| p.2.to_string()));
        },
        ControlRequest::SetPublishedInputPortValues { values } => {
            for (port, value) in values {
                let value = serde_json::from_str(value).unwrap_or(Value::Null);
                ports.published.insert(port.clone(), value);
            }
        },
        ControlRequest::PublishedInputPortValue { port }
        | ControlRequest::PublishedOutputPortValue { port } => {
            reply.push(ports.published.get(port).map(Value::to_string));
        },
        ControlRequest::Stop { .. }
        | ControlRequest::FireTriggerPortEvent { .. }
        | ControlRequest::FirePublishedInputPortEvent { .. }
        | ControlRequest::UnsubscribeInputPortTelemetry { .. }
        | ControlRequest::UnsubscribeOutputPortTelemetry { .. }
        | ControlRequest::SubscribeEventTelemetry { .. }
        | ControlRequest::UnsubscribeEventTelemetry { .. }
        | ControlRequest::SubscribeAllTelemetry { .. }
        | ControlRequest::UnsubscribeAllTelemetry { .. } => {},
    }
    reply
}
