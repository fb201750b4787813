//! The caller-side event loop an in-process composition depends on.
//!
//! A composition loaded into the runner's own process posts work to the
//! host's main thread. While the runner blocks that thread (starting,
//! stopping), it keeps draining the loop so the composition can progress.

use std::ffi::c_void;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use cascade_protocol::abi::MainJobFn;
use crossbeam_channel::{Receiver, Sender};

pub type MainJob = Box<dyn FnOnce() + Send + 'static>;

pub trait EventLoop: Send + Sync {
    /// Runs pending work, waiting up to `timeout` for the first item.
    /// Returns how many items ran.
    fn drain(&self, timeout: Duration) -> usize;

    /// Whether the current thread is the one that services this loop.
    fn is_loop_thread(&self) -> bool;
}

impl<L: EventLoop + ?Sized> EventLoop for &'static L {
    fn drain(&self, timeout: Duration) -> usize {
        (**self).drain(timeout)
    }

    fn is_loop_thread(&self) -> bool {
        (**self).is_loop_thread()
    }
}

/// Process-wide main queue.
///
/// The first thread that drains it becomes its owner; only that thread
/// counts as the loop thread afterwards. Until then every thread does.
pub struct MainQueue {
    tx: Sender<MainJob>,
    rx: Receiver<MainJob>,
    owner: OnceLock<ThreadId>,
}

impl MainQueue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            owner: OnceLock::new(),
        }
    }

    pub fn global() -> &'static MainQueue {
        static QUEUE: OnceLock<MainQueue> = OnceLock::new();
        QUEUE.get_or_init(MainQueue::new)
    }

    pub fn post(&self, job: MainJob) {
        // The queue owns both ends, so the send cannot fail.
        let _ = self.tx.send(job);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl EventLoop for MainQueue {
    fn drain(&self, timeout: Duration) -> usize {
        let current = thread::current().id();
        if *self.owner.get_or_init(|| current) != current {
            tracing::warn!("main queue drained off its owning thread");
        }
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        if let Ok(job) = self.rx.recv_deadline(deadline) {
            job();
            ran += 1;
        }
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    fn is_loop_thread(&self) -> bool {
        self.owner
            .get()
            .is_none_or(|owner| *owner == thread::current().id())
    }
}

pub fn run_on_main_thread(job: impl FnOnce() + Send + 'static) {
    MainQueue::global().post(Box::new(job));
}

/// Runs everything queued for the main thread. Hosts without their own
/// event loop call this periodically from the thread that owns the runner.
pub fn drain_main_queue(timeout: Duration) -> usize {
    MainQueue::global().drain(timeout)
}

struct SendPtr(*mut c_void);

// SAFETY: the composition hands over a context pointer that it promises
// to keep valid until its job runs, on whichever thread drains the queue.
unsafe impl Send for SendPtr {}

/// C entry point given to in-process compositions as `post_to_main`.
pub(crate) unsafe extern "C" fn post_to_main_queue(job: MainJobFn, context: *mut c_void) {
    let context = SendPtr(context);
    run_on_main_thread(move || {
        let context = context;
        // SAFETY: `job` and `context` come from the composition as a pair.
        unsafe { job(context.0) };
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::{EventLoop, MainQueue};

    #[test]
    fn drain_runs_jobs_in_post_order_and_claims_the_thread() {
        let queue = MainQueue::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.post(Box::new(move || order.lock().push(i)));
        }
        assert!(queue.is_loop_thread());
        assert_eq!(queue.drain(Duration::from_millis(10)), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(queue.is_loop_thread());
        thread::scope(|scope| {
            scope.spawn(|| assert!(!queue.is_loop_thread()));
        });
    }

    #[test]
    fn drain_waits_for_late_job() {
        let queue = Arc::new(MainQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let poster = {
            let queue = Arc::clone(&queue);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.post(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            })
        };
        assert_eq!(queue.drain(Duration::from_secs(2)), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        poster.join().expect("poster");
    }
}
