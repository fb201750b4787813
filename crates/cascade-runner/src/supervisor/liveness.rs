use std::fs::File;
use std::io::Read;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Completes when a composition's process tree has exited.
///
/// Nothing is ever sent on the channel; it disconnects on exit, which makes
/// it usable directly in `crossbeam_channel::select!`.
#[derive(Clone)]
pub struct Liveness {
    rx: Receiver<()>,
}

/// Held by whatever observes the composition; dropping it reports exit.
pub struct LivenessNotifier {
    _tx: Sender<()>,
}

impl LivenessNotifier {
    pub fn exited(self) {}
}

impl Liveness {
    pub fn channel() -> (LivenessNotifier, Liveness) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (LivenessNotifier { _tx: tx }, Liveness { rx })
    }

    /// Watches the read end of the liveness pipe. The write end lives only
    /// in the composition's process tree, so EOF means every holder exited.
    pub fn watch_pipe(mut read_end: File) -> std::io::Result<Self> {
        let (notifier, liveness) = Self::channel();
        thread::Builder::new()
            .name("cascade-liveness".to_string())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match read_end.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            tracing::debug!(error = %err, "liveness pipe read failed");
                            break;
                        },
                    }
                }
                notifier.exited();
            })?;
        Ok(liveness)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Returns `true` if the tree exited within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        loop {
            match self.rx.recv_timeout(timeout) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::time::Duration;

    use super::Liveness;

    #[test]
    fn notifier_drop_reports_exit() {
        let (notifier, liveness) = Liveness::channel();
        assert!(!liveness.has_exited());
        assert!(!liveness.wait_timeout(Duration::from_millis(5)));
        notifier.exited();
        assert!(liveness.has_exited());
        assert!(liveness.wait_timeout(Duration::ZERO));
    }

    #[cfg(unix)]
    #[test]
    fn pipe_eof_reports_exit_but_data_does_not() {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors were just created and are owned here.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let liveness = Liveness::watch_pipe(read_end.into()).expect("watch");
        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"still here").expect("write");
        assert!(!liveness.wait_timeout(Duration::from_millis(20)));

        drop(writer);
        assert!(liveness.wait_timeout(Duration::from_secs(2)));
    }
}
