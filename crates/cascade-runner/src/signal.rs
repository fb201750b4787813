use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Completion signal for "fire a published event, then wait for it".
///
/// `arm` is called when an event is fired and discards any earlier
/// completion. `raise` latches at most once per `arm`, and only while a
/// fire is still awaiting its completion, so repeated or late completions
/// never accumulate into a stale count. `wait` consumes the latch.
#[derive(Default)]
pub struct SaturatingSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    armed: bool,
    latched: bool,
}

impl SaturatingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        let mut state = self.state.lock();
        state.armed = true;
        state.latched = false;
    }

    /// Returns whether this call latched the signal.
    pub fn raise(&self) -> bool {
        let mut state = self.state.lock();
        if !state.armed {
            return false;
        }
        state.armed = false;
        state.latched = true;
        self.cond.notify_all();
        true
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.latched {
            self.cond.wait(&mut state);
        }
        state.latched = false;
    }

    /// Returns `false` if the timeout elapsed without a completion.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.latched {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        state.latched = false;
        true
    }

    /// Releases every waiter without a completion, used when the session
    /// ends while a wait is outstanding.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.latched = true;
        self.cond.notify_all();
    }
}

/// One-way flag that wakes every waiter once set.
#[derive(Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the call that actually set the latch.
    pub fn set(&self) -> bool {
        let mut set = self.set.lock();
        if *set {
            return false;
        }
        *set = true;
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Latch, SaturatingSignal};

    #[test]
    fn completion_without_fire_is_ignored() {
        let signal = SaturatingSignal::new();
        assert!(!signal.raise());
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn unwaited_completion_does_not_satisfy_the_next_fire() {
        let signal = SaturatingSignal::new();
        signal.arm();
        assert!(signal.raise());

        signal.arm();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(signal.raise());
        assert!(signal.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn repeated_completions_saturate_to_one() {
        let signal = SaturatingSignal::new();
        signal.arm();
        assert!(signal.raise());
        assert!(!signal.raise());
        assert!(signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn sequential_fire_wait_pairs_each_block_for_their_own_completion() {
        let signal = Arc::new(SaturatingSignal::new());
        for _ in 0..2 {
            signal.arm();
            let raiser = {
                let signal = Arc::clone(&signal);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(30));
                    signal.raise();
                })
            };
            assert!(!signal.wait_timeout(Duration::from_millis(5)));
            assert!(signal.wait_timeout(Duration::from_secs(2)));
            raiser.join().expect("raiser");
        }
    }

    #[test]
    fn latch_sets_once() {
        let latch = Latch::new();
        assert!(latch.set());
        assert!(!latch.set());
        assert!(latch.wait_timeout(Duration::ZERO));
    }
}
