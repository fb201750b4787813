//! Telemetry listener: one thread per connected session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cascade_protocol::{Message, Subscriber, Telemetry, TelemetryTag};
use crossbeam_channel::{Sender, select};

use crate::config::RunnerOptions;
use crate::delegate::DelegateQueue;
use crate::signal::{Latch, SaturatingSignal};
use crate::supervisor::Liveness;

pub(crate) type LostContactHook = Arc<dyn Fn(String) + Send + Sync>;

/// What the listener reports into.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub delegate: Arc<DelegateQueue>,
    pub fired_event: Arc<SaturatingSignal>,
    pub options: Arc<RunnerOptions>,
    /// Set while the runner shuts the session down on purpose; silence and
    /// disconnects are expected then.
    pub stopping: Arc<AtomicBool>,
    pub on_lost_contact: LostContactHook,
}

pub(crate) struct TelemetryListener {
    cancel: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Exit,
}

impl TelemetryListener {
    /// Subscribes to every telemetry tag and starts listening. `heard` is
    /// set when the first message arrives.
    pub fn spawn(
        subscriber: Subscriber,
        liveness: Option<Liveness>,
        heard: Arc<Latch>,
        context: ListenerContext,
    ) -> std::io::Result<Self> {
        for tag in TelemetryTag::ALL {
            subscriber.subscribe(*tag);
        }
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let join = thread::Builder::new()
            .name("cascade-telemetry".to_string())
            .spawn(move || {
                let mut state = ListenState {
                    context,
                    heard,
                    clock: SleepClock::default(),
                };
                state.run(&subscriber, liveness.as_ref(), &cancel_rx);
                tracing::debug!("telemetry listener exited");
            })?;
        Ok(Self {
            cancel: Some(cancel_tx),
            join: Some(join),
        })
    }

    /// Interrupts the listener, which drains what already arrived and exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                return;
            }
            let _ = join.join();
        }
    }
}

impl Drop for TelemetryListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ListenState {
    context: ListenerContext,
    heard: Arc<Latch>,
    clock: SleepClock,
}

impl ListenState {
    fn run(
        &mut self,
        subscriber: &Subscriber,
        liveness: Option<&Liveness>,
        cancel: &crossbeam_channel::Receiver<()>,
    ) {
        let telemetry = subscriber.receiver();
        let exited = liveness
            .map(|liveness| liveness.receiver().clone())
            .unwrap_or_else(crossbeam_channel::never);

        loop {
            let timeout = if self.heard.is_set() {
                self.context.options.heartbeat_timeout()
            } else {
                self.context.options.startup_timeout()
            };
            self.clock.mark();
            select! {
                recv(cancel) -> _ => {
                    while let Ok(Ok(message)) = telemetry.try_recv() {
                        if let Flow::Exit = self.handle(&message) {
                            break;
                        }
                    }
                    return;
                },
                recv(telemetry) -> delivery => match delivery {
                    Ok(Ok(message)) => {
                        self.heard.set();
                        if let Flow::Exit = self.handle(&message) {
                            return;
                        }
                    },
                    Ok(Err(err)) => {
                        self.lost(format!("telemetry channel failed: {err}"));
                        return;
                    },
                    Err(_) => return,
                },
                recv(exited) -> _ => {
                    self.lost("composition process exited".to_string());
                    return;
                },
                default(timeout) => {
                    if self.tolerates_silence() {
                        continue;
                    }
                    self.lost(format!("no telemetry for {}ms", timeout.as_millis()));
                    return;
                },
            }
        }
    }

    fn handle(&mut self, message: &Message) -> Flow {
        let telemetry = match Telemetry::from_message(message) {
            Ok(telemetry) => telemetry,
            Err(err) => {
                self.lost(format!("undecodable telemetry: {err}"));
                return Flow::Exit;
            },
        };
        let delegate = &self.context.delegate;
        match telemetry {
            Telemetry::Heartbeat => {},
            Telemetry::NodeExecutionStarted { composition, node } => {
                delegate.dispatch(move |d| d.node_execution_started(&composition, &node));
            },
            Telemetry::NodeExecutionFinished { composition, node } => {
                delegate.dispatch(move |d| d.node_execution_finished(&composition, &node));
            },
            Telemetry::InputPortsUpdated(updates) => delegate.dispatch(move |d| {
                for update in &updates {
                    d.input_port_updated(update);
                }
            }),
            Telemetry::OutputPortsUpdated(updates) => delegate.dispatch(move |d| {
                for update in &updates {
                    d.output_port_updated(update);
                }
            }),
            Telemetry::PublishedOutputPortsUpdated(updates) => delegate.dispatch(move |d| {
                for update in &updates {
                    d.published_output_port_updated(&update.port, update.sent_data, &update.summary);
                }
            }),
            Telemetry::EventFinished => {
                self.context.fired_event.raise();
                delegate.dispatch(|d| d.event_finished());
            },
            Telemetry::EventDropped { composition, port } => {
                delegate.dispatch(move |d| d.event_dropped(&composition, &port));
            },
            Telemetry::Error { message } => {
                if self.context.options.is_quiet_error(&message) {
                    tracing::debug!(%message, "composition error");
                } else {
                    tracing::warn!(%message, "composition error");
                }
                delegate.dispatch(move |d| d.composition_error(&message));
            },
            Telemetry::StopRequested => {
                tracing::info!("composition asked to be stopped");
                self.lost("composition requested stop".to_string());
            },
        }
        Flow::Continue
    }

    fn tolerates_silence(&mut self) -> bool {
        if self.context.stopping.load(Ordering::SeqCst) {
            return true;
        }
        if self.context.options.tolerate_host_sleep && self.clock.slept() {
            tracing::debug!("host slept while waiting for telemetry");
            return true;
        }
        if self.context.options.tolerate_debugger && debugger_attached() {
            tracing::debug!("debugger attached; ignoring telemetry silence");
            return true;
        }
        false
    }

    fn lost(&self, reason: String) {
        if self.context.stopping.load(Ordering::SeqCst) {
            tracing::debug!(%reason, "telemetry ended during stop");
            return;
        }
        (self.context.on_lost_contact)(reason);
    }
}

/// Detects suspends: time spent asleep advances the boot clock but not the
/// monotonic one.
#[derive(Default)]
struct SleepClock {
    baseline: Option<Duration>,
}

impl SleepClock {
    const THRESHOLD: Duration = Duration::from_millis(500);

    fn mark(&mut self) {
        self.baseline = suspended_time();
    }

    fn slept(&mut self) -> bool {
        let now = suspended_time();
        let slept = match (self.baseline, now) {
            (Some(before), Some(after)) => after.saturating_sub(before) > Self::THRESHOLD,
            _ => false,
        };
        self.baseline = now;
        slept
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn suspended_time() -> Option<Duration> {
    fn read(clock: libc::clockid_t) -> Option<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer for clock_gettime.
        if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
            return None;
        }
        Some(Duration::new(
            u64::try_from(ts.tv_sec).ok()?,
            u32::try_from(ts.tv_nsec).ok()?,
        ))
    }
    let boot = read(libc::CLOCK_BOOTTIME)?;
    let monotonic = read(libc::CLOCK_MONOTONIC)?;
    Some(boot.saturating_sub(monotonic))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn suspended_time() -> Option<Duration> {
    None
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .as_deref()
        .and_then(tracer_pid)
        .is_some_and(|pid| pid != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn debugger_attached() -> bool {
    false
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
