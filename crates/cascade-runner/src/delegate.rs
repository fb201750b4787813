//! Serialized delivery of runner notifications to the user's delegate.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle, ThreadId};

use cascade_protocol::PortUpdate;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Receives telemetry and session notifications.
///
/// Calls arrive one at a time on the runner's delegate thread, in the order
/// the telemetry was received. Every method defaults to doing nothing.
pub trait RunnerDelegate: Send + 'static {
    fn node_execution_started(&mut self, _composition: &str, _node: &str) {}

    fn node_execution_finished(&mut self, _composition: &str, _node: &str) {}

    fn input_port_updated(&mut self, _update: &PortUpdate) {}

    fn output_port_updated(&mut self, _update: &PortUpdate) {}

    fn published_output_port_updated(&mut self, _port: &str, _sent_data: bool, _summary: &str) {}

    /// The most recent published-input event finished propagating.
    fn event_finished(&mut self) {}

    fn event_dropped(&mut self, _composition: &str, _port: &str) {}

    fn composition_error(&mut self, _message: &str) {}

    /// Delivered at most once per session.
    fn lost_contact(&mut self) {}
}

type Slot = Option<Box<dyn RunnerDelegate>>;
type Job = Box<dyn FnOnce(&mut Slot) + Send>;

/// Single-threaded queue owning the delegate.
///
/// A panicking delegate is discarded and later notifications are dropped,
/// so one faulty callback cannot take the listener down with it.
pub struct DelegateQueue {
    tx: Mutex<Option<Sender<Job>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DelegateQueue {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let join = thread::Builder::new()
            .name("cascade-delegate".to_string())
            .spawn(move || {
                let mut slot: Slot = None;
                while let Ok(job) = rx.recv() {
                    let result = catch_unwind(AssertUnwindSafe(|| job(&mut slot)));
                    if result.is_err() {
                        tracing::warn!("runner delegate panicked; discarding it");
                        slot = None;
                    }
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    /// Queues a call on the delegate, if one is set.
    pub fn dispatch(&self, call: impl FnOnce(&mut dyn RunnerDelegate) + Send + 'static) {
        self.submit(Box::new(move |slot: &mut Slot| {
            if let Some(delegate) = slot.as_mut() {
                call(delegate.as_mut());
            }
        }));
    }

    /// Replaces the delegate. Telemetry queued before this call still goes
    /// to the previous delegate. Blocks until the swap happened, except when
    /// called from a delegate callback.
    pub fn set_delegate(&self, delegate: Option<Box<dyn RunnerDelegate>>) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(Box::new(move |slot: &mut Slot| {
            *slot = delegate;
            let _ = done_tx.send(());
        }));
        if thread::current().id() != self.thread_id {
            let _ = done_rx.blocking_recv();
        }
    }

    /// Waits until every call queued so far has run.
    pub fn flush(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(Box::new(move |_: &mut Slot| {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.blocking_recv();
    }

    /// Runs the remaining calls and stops the delegate thread.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }

    fn submit(&self, job: Job) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(job);
        }
    }
}

impl Drop for DelegateQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
