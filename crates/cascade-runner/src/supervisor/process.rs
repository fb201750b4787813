//! Separate-process compositions, started with a double fork.
//!
//! The runner forks a short-lived child that forks the composition, writes
//! the grandchild's pid to a pipe and exits at once. The runner reaps the
//! child, so no zombie is left behind, and the composition is reparented to
//! init. Exec failures travel back over a close-on-exec status pipe.

use std::ffi::{CString, c_char, c_int};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cascade_protocol::CompositionArgs;

use super::{CompositionInstance, LaunchSpec, Liveness, delete_binary, ensure_file};
use crate::error::{Error, ErrorContext, Result};

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

fn cloexec_pipe() -> io::Result<Pipe> {
    let mut fds: [c_int; 2] = [-1; 2];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // SAFETY: `fds` has room for the two descriptors pipe2() writes.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let rc = {
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc == 0 {
            for fd in fds {
                // SAFETY: `fd` was just returned by pipe().
                unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            }
        }
        rc
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe succeeded, so both descriptors are open and unowned.
    unsafe {
        Ok(Pipe {
            read: OwnedFd::from_raw_fd(fds[0]),
            write: OwnedFd::from_raw_fd(fds[1]),
        })
    }
}

pub(crate) struct ProcessInstance {
    pid: libc::pid_t,
    liveness: Liveness,
    /// Write end of the runner pipe; the composition sees EOF once the
    /// runner closes it or dies.
    runner_pipe: Option<OwnedFd>,
    executable: Option<PathBuf>,
    shut_down: bool,
}

/// Everything the forked children touch, prepared before `fork` so the
/// children never allocate.
struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    cwd: Option<CString>,
    inherited: [RawFd; 2],
}

pub(crate) fn spawn(program: &Path, argv0: &str, spec: &LaunchSpec) -> Result<ProcessInstance> {
    ensure_file(program, "composition executable")?;

    let liveness = cloexec_pipe().start_context("liveness pipe")?;
    let runner = cloexec_pipe().start_context("runner pipe")?;
    let handshake = cloexec_pipe().start_context("pid pipe")?;
    let status = cloexec_pipe().start_context("exec status pipe")?;

    let mut args = CompositionArgs::new(
        spec.endpoints.control.clone(),
        spec.endpoints.telemetry.clone(),
    );
    args.loader = spec.endpoints.loader.clone();
    args.runner_pid = Some(std::process::id());
    args.runner_pipe = Some(runner.read.as_raw_fd());
    args.liveness_pipe = Some(liveness.write.as_raw_fd());
    args.start_paused = spec.start_paused;
    args.continue_if_runner_dies = spec.continue_if_runner_dies;

    let plan = ExecPlan {
        program: CString::new(program.as_os_str().as_bytes()).start_context("exec arguments")?,
        argv: std::iter::once(argv0.to_string())
            .chain(args.to_args())
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()
            .start_context("exec arguments")?,
        cwd: spec
            .source_dir
            .as_ref()
            .map(|dir| CString::new(dir.as_os_str().as_bytes()))
            .transpose()
            .start_context("exec arguments")?,
        inherited: [liveness.write.as_raw_fd(), runner.read.as_raw_fd()],
    };
    let mut argv_ptrs = plan
        .argv
        .iter()
        .map(|arg| arg.as_ptr())
        .collect::<Vec<*const c_char>>();
    argv_ptrs.push(std::ptr::null());

    // SAFETY: the child only calls async-signal-safe functions (fork,
    // setpgid, chdir, fcntl, execv, write, _exit) on memory prepared above.
    let child = unsafe { libc::fork() };
    if child < 0 {
        return Err(Error::start_failure(
            "fork",
            io::Error::last_os_error().to_string(),
        ));
    }
    if child == 0 {
        // SAFETY: we are the freshly forked child; this never returns.
        unsafe {
            run_intermediate_child(
                &plan,
                &argv_ptrs,
                handshake.write.as_raw_fd(),
                status.write.as_raw_fd(),
            )
        }
    }

    let Pipe {
        read: handshake_read,
        write: handshake_write,
    } = handshake;
    let Pipe {
        read: status_read,
        write: status_write,
    } = status;
    let Pipe {
        read: liveness_read,
        write: liveness_write,
    } = liveness;
    let Pipe {
        read: runner_read,
        write: runner_write,
    } = runner;
    drop((handshake_write, status_write, liveness_write, runner_read));

    reap(child).start_context("wait for launcher")?;

    let mut status_bytes = Vec::new();
    File::from(status_read)
        .read_to_end(&mut status_bytes)
        .start_context("exec status")?;
    if let Ok(errno) = <[u8; 4]>::try_from(status_bytes.as_slice()) {
        let err = io::Error::from_raw_os_error(i32::from_ne_bytes(errno));
        return Err(Error::start_failure(
            "exec",
            format!("`{}`: {err}", program.display()),
        ));
    }

    let mut pid_bytes = [0u8; std::mem::size_of::<libc::pid_t>()];
    File::from(handshake_read)
        .read_exact(&mut pid_bytes)
        .start_context("pid handshake")?;
    let pid = libc::pid_t::from_ne_bytes(pid_bytes);

    let liveness = Liveness::watch_pipe(File::from(liveness_read)).start_context("liveness watch")?;
    tracing::info!(pid, program = %program.display(), "composition process started");
    Ok(ProcessInstance {
        pid,
        liveness,
        runner_pipe: Some(runner_write),
        executable: (spec.delete_binaries && matches!(spec.mode, super::LaunchMode::Executable { .. }))
            .then(|| program.to_path_buf()),
        shut_down: false,
    })
}

fn reap(child: libc::pid_t) -> io::Result<()> {
    let mut status: c_int = 0;
    loop {
        // SAFETY: `child` is our own direct child.
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe fn report_errno(fd: RawFd, errno: i32) {
    let bytes = errno.to_ne_bytes();
    // SAFETY: `bytes` outlives the call; a short write only loses detail.
    unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
}

unsafe fn run_intermediate_child(
    plan: &ExecPlan,
    argv: &[*const c_char],
    handshake_write: RawFd,
    status_write: RawFd,
) -> ! {
    // SAFETY: single-threaded after fork; only async-signal-safe calls.
    unsafe {
        let grandchild = libc::fork();
        if grandchild < 0 {
            report_errno(status_write, last_errno());
            libc::_exit(1);
        }
        if grandchild == 0 {
            exec_composition(plan, argv, status_write);
        }
        let bytes = grandchild.to_ne_bytes();
        libc::write(handshake_write, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(0);
    }
}

unsafe fn exec_composition(plan: &ExecPlan, argv: &[*const c_char], status_write: RawFd) -> ! {
    // SAFETY: single-threaded after fork; only async-signal-safe calls.
    unsafe {
        libc::setpgid(0, 0);
        if let Some(cwd) = &plan.cwd
            && libc::chdir(cwd.as_ptr()) != 0
        {
            report_errno(status_write, last_errno());
            libc::_exit(127);
        }
        for fd in plan.inherited {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
        }
        libc::execv(plan.program.as_ptr(), argv.as_ptr());
        report_errno(status_write, last_errno());
        libc::_exit(127);
    }
}

impl ProcessInstance {
    fn kill_group(&self) {
        // SAFETY: signalling a process group has no memory-safety impact.
        let rc = unsafe { libc::killpg(self.pid, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = self.pid, error = %err, "failed to kill composition process group");
            }
        }
    }
}

impl CompositionInstance for ProcessInstance {
    fn pid(&self) -> Option<u32> {
        u32::try_from(self.pid).ok()
    }

    fn is_in_process(&self) -> bool {
        false
    }

    fn liveness(&self) -> Option<Liveness> {
        Some(self.liveness.clone())
    }

    fn shutdown(&mut self, grace: Duration) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.runner_pipe.take();

        if !self.liveness.wait_timeout(grace) {
            tracing::warn!(pid = self.pid, "composition did not exit in time; killing it");
            self.kill_group();
            if !self.liveness.wait_timeout(grace) {
                return Err(Error::operation(
                    "shutdown",
                    format!("process group {} still holds the liveness pipe", self.pid),
                ));
            }
        }
        if let Some(executable) = self.executable.take() {
            delete_binary(&executable);
        }
        tracing::info!(pid = self.pid, "composition process exited");
        Ok(())
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        if !self.shut_down && !self.liveness.has_exited() {
            self.kill_group();
        }
    }
}
