//! The session controller.
//!
//! A [`Runner`] owns one composition session: it launches the composition,
//! serializes Control exchanges, forwards telemetry to the delegate and
//! tears everything down again. Sessions are single-use.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use cascade_protocol::{
    ControlRequest, LoaderReplyTag, LoaderRequest, Message, RequestChannel, Subscriber,
};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::config::RunnerOptions;
use crate::delegate::{DelegateQueue, RunnerDelegate};
use crate::error::{Error, ErrorContext, Result};
use crate::event_loop::{EventLoop, MainQueue};
use crate::ledger::{LoadAttempt, RunningLibrarySet};
use crate::listener::{ListenerContext, TelemetryListener};
use crate::port::PublishedPort;
use crate::signal::{Latch, SaturatingSignal};
use crate::supervisor::{
    CompositionHost, CompositionInstance, LaunchMode, LaunchSpec, Liveness, SessionEndpoints,
    default_composition_host, delete_binary,
};

mod ports;

/// How long a blocked loop thread waits before running queued work again.
const DRAIN_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Stopped,
    Starting,
    Paused,
    Running,
    Stopping,
}

/// Handle to a composition session. Clones share the session.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

pub struct RunnerBuilder {
    mode: LaunchMode,
    source_dir: Option<PathBuf>,
    options: RunnerOptions,
    host: Option<Arc<dyn CompositionHost>>,
    event_loop: Option<Arc<dyn EventLoop>>,
    libraries: RunningLibrarySet,
}

impl RunnerBuilder {
    pub fn new(mode: LaunchMode) -> Self {
        Self {
            mode,
            source_dir: None,
            options: RunnerOptions::default(),
            host: None,
            event_loop: None,
            libraries: RunningLibrarySet::new(),
        }
    }

    /// Working directory of the composition.
    pub fn source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Launches compositions through `host` instead of real processes.
    pub fn host(mut self, host: Arc<dyn CompositionHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// The loop an in-process composition posts main-thread work to.
    /// Defaults to the process-wide [`MainQueue`].
    pub fn event_loop(mut self, event_loop: Arc<dyn EventLoop>) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Libraries the loader has to load alongside the first module.
    pub fn libraries(mut self, libraries: RunningLibrarySet) -> Self {
        self.libraries = libraries;
        self
    }

    pub fn build(self) -> Result<Runner> {
        self.options.validate()?;
        if let Some(dir) = &self.source_dir
            && !dir.is_dir()
        {
            return Err(Error::not_found(
                "source directory",
                dir.display().to_string(),
            ));
        }
        let delegate = Arc::new(DelegateQueue::spawn().start_context("delegate thread")?);
        let event_loop = match self.event_loop {
            Some(event_loop) => Some(event_loop),
            None if self.mode.is_in_process() => {
                Some(Arc::new(MainQueue::global()) as Arc<dyn EventLoop>)
            },
            None => None,
        };
        let mut libraries = self.libraries;
        libraries.set_delete_resource_libraries(self.options.delete_binaries_when_finished);
        let initial_module = match &self.mode {
            LaunchMode::Loader { module, .. } => Some(module.clone()),
            _ => None,
        };

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            mode: self.mode,
            source_dir: self.source_dir,
            options: Arc::new(self.options),
            host: self.host.unwrap_or_else(default_composition_host),
            event_loop,
            delegate,
            fired_event: Arc::new(SaturatingSignal::new()),
            state: Mutex::new(RunnerState::Stopped),
            started: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            lost: AtomicBool::new(false),
            stopped: Latch::new(),
            stop_lock: Mutex::new(()),
            control: Mutex::new(ControlState {
                module: initial_module,
                ..ControlState::default()
            }),
            instance: Mutex::new(None),
            listener: Mutex::new(None),
            handshake: Mutex::new(Handshake::default()),
            published_inputs: ArcSwapOption::empty(),
            published_outputs: ArcSwapOption::empty(),
            libraries: Mutex::new(libraries),
        });
        Ok(Runner { inner })
    }
}

#[derive(Default)]
struct ControlState {
    session_dir: Option<TempDir>,
    endpoints: Option<SessionEndpoints>,
    control: Option<RequestChannel>,
    loader: Option<RequestChannel>,
    /// Module the loader currently runs.
    module: Option<PathBuf>,
}

/// Contact lost while the session is still starting fails the start
/// instead of the session.
#[derive(Default)]
struct Handshake {
    /// Set by the listener on the first telemetry message.
    heard: Option<Arc<Latch>>,
    failure: Option<String>,
}

struct Inner {
    me: Weak<Inner>,
    mode: LaunchMode,
    source_dir: Option<PathBuf>,
    options: Arc<RunnerOptions>,
    host: Arc<dyn CompositionHost>,
    event_loop: Option<Arc<dyn EventLoop>>,
    delegate: Arc<DelegateQueue>,
    fired_event: Arc<SaturatingSignal>,
    state: Mutex<RunnerState>,
    started: AtomicBool,
    stopping: Arc<AtomicBool>,
    lost: AtomicBool,
    stopped: Latch,
    stop_lock: Mutex<()>,
    /// The control queue: at most one exchange is in flight while held.
    control: Mutex<ControlState>,
    instance: Mutex<Option<Box<dyn CompositionInstance>>>,
    listener: Mutex<Option<TelemetryListener>>,
    /// Lock order: `state` before `handshake`.
    handshake: Mutex<Handshake>,
    published_inputs: ArcSwapOption<Vec<Arc<PublishedPort>>>,
    published_outputs: ArcSwapOption<Vec<Arc<PublishedPort>>>,
    libraries: Mutex<RunningLibrarySet>,
}

impl Runner {
    pub fn builder(mode: LaunchMode) -> RunnerBuilder {
        RunnerBuilder::new(mode)
    }

    /// A composition executable run in its own process.
    pub fn executable(executable: impl Into<PathBuf>, options: RunnerOptions) -> Result<Self> {
        RunnerBuilder::new(LaunchMode::Executable {
            executable: executable.into(),
        })
        .options(options)
        .build()
    }

    /// A composition module run by the generic loader, replaceable while
    /// it runs.
    pub fn loader(
        loader: impl Into<PathBuf>,
        module: impl Into<PathBuf>,
        options: RunnerOptions,
    ) -> Result<Self> {
        RunnerBuilder::new(LaunchMode::Loader {
            loader: loader.into(),
            module: module.into(),
        })
        .options(options)
        .build()
    }

    /// A composition module loaded into this process.
    pub fn module(module: impl Into<PathBuf>, options: RunnerOptions) -> Result<Self> {
        RunnerBuilder::new(LaunchMode::Module {
            module: module.into(),
        })
        .options(options)
        .build()
    }

    pub fn mode(&self) -> &LaunchMode {
        &self.inner.mode
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> RunnerState {
        *self.inner.state.lock()
    }

    /// Launches the composition and lets it run.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.run_while_draining(|| {
            inner.start_internal()?;
            inner.unpause()
        })
    }

    /// Launches the composition without letting it run; call
    /// [`Runner::unpause`] once ports are set up.
    pub fn start_paused(&self) -> Result<()> {
        let inner = &self.inner;
        inner.run_while_draining(|| inner.start_internal())
    }

    pub fn pause(&self) -> Result<()> {
        self.inner.pause()
    }

    pub fn unpause(&self) -> Result<()> {
        self.inner.unpause()
    }

    /// Stops the composition and releases the session. Idempotent; cleanup
    /// failures are logged.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Blocks until the session has stopped, by request or after losing
    /// contact. Returns at once for a session that never started.
    pub fn wait_until_stopped(&self) {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) {
            return;
        }
        match inner.draining_loop() {
            Some(event_loop) => {
                while !inner.stopped.wait_timeout(DRAIN_SLICE) {
                    event_loop.drain(DRAIN_SLICE);
                }
            },
            None => inner.stopped.wait(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == RunnerState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunnerState::Paused
    }

    pub fn has_lost_contact(&self) -> bool {
        self.inner.lost.load(Ordering::SeqCst)
    }

    /// Process id of the composition (this process for in-process
    /// sessions), while it runs.
    pub fn composition_pid(&self) -> Option<u32> {
        self.inner.instance.lock().as_ref().and_then(|i| i.pid())
    }

    /// Replaces the delegate; telemetry already queued still goes to the
    /// previous one.
    pub fn set_delegate(&self, delegate: Option<Box<dyn RunnerDelegate>>) {
        self.inner.delegate.set_delegate(delegate);
    }

    /// Swaps the composition module of a loader session without
    /// restarting its process.
    pub fn replace_composition(
        &self,
        module: impl AsRef<Path>,
        change_description: Option<&str>,
    ) -> Result<()> {
        self.inner
            .replace_composition(module.as_ref(), change_description)
    }

    /// Edits the library ledger, e.g. to queue libraries before the next
    /// [`Runner::replace_composition`].
    pub fn update_libraries<T>(&self, edit: impl FnOnce(&mut RunningLibrarySet) -> T) -> T {
        edit(&mut self.inner.libraries.lock())
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
            && matches!(
                *self.state.lock(),
                RunnerState::Starting | RunnerState::Paused | RunnerState::Running
            )
    }

    fn set_state(&self, next: RunnerState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "runner state");
            *state = next;
        }
    }

    /// The in-process composition's event loop, when the calling thread is
    /// the one servicing it and so must not block.
    fn draining_loop(&self) -> Option<&Arc<dyn EventLoop>> {
        self.event_loop
            .as_ref()
            .filter(|event_loop| self.mode.is_in_process() && event_loop.is_loop_thread())
    }

    /// Runs `work` on a helper thread while this thread keeps the
    /// in-process composition's event loop going.
    fn run_while_draining<T: Send>(&self, work: impl FnOnce() -> T + Send) -> T {
        let Some(event_loop) = self.draining_loop() else {
            return work();
        };
        // Claims the loop for this thread before the helper can look at it.
        event_loop.drain(Duration::ZERO);
        thread::scope(|scope| {
            let handle = scope.spawn(work);
            while !handle.is_finished() {
                event_loop.drain(Duration::from_millis(10));
            }
            match handle.join() {
                Ok(value) => value,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    }

    fn start_internal(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(Error::invalid_input(
                    "the session was already started; sessions are single-use",
                ));
            }
            *state = RunnerState::Starting;
        }
        tracing::info!(mode = ?self.mode, "starting composition");
        match self.launch() {
            Ok(()) => {
                let late_failure = {
                    let mut state = self.state.lock();
                    *state = RunnerState::Paused;
                    let mut handshake = self.handshake.lock();
                    handshake.heard = None;
                    handshake.failure.take()
                };
                tracing::debug!("composition started paused");
                if let Some(reason) = late_failure {
                    self.lose_contact(reason);
                }
                Ok(())
            },
            Err(err) => {
                let err = err.into_start_failure("handshake");
                tracing::warn!(error = %err, "composition failed to start");
                self.stopping.store(true, Ordering::SeqCst);
                self.teardown();
                self.set_state(RunnerState::Stopped);
                self.stopped.set();
                Err(err)
            },
        }
    }

    fn launch(&self) -> Result<()> {
        let session_dir = tempfile::Builder::new()
            .prefix("cascade-")
            .tempdir()
            .start_context("session directory")?;
        let endpoints = SessionEndpoints::in_dir(session_dir.path(), self.mode.uses_loader());
        let spec = LaunchSpec {
            mode: self.mode.clone(),
            endpoints: endpoints.clone(),
            source_dir: self.source_dir.clone(),
            start_paused: true,
            continue_if_runner_dies: self.options.continue_if_runner_dies,
            delete_binaries: self.options.delete_binaries_when_finished,
        };

        let mut control = self.control.lock();
        control.session_dir = Some(session_dir);
        control.endpoints = Some(endpoints.clone());

        let instance = self.host.launch(&spec)?;
        let liveness = instance.liveness();
        *self.instance.lock() = Some(instance);

        match &endpoints.loader {
            Some(loader) => {
                let channel = RequestChannel::connect(loader, self.options.connect_retry())
                    .start_context("connect loader control")?;
                control.loader = Some(channel);
                let module = control
                    .module
                    .clone()
                    .ok_or_else(|| Error::start_failure("load module", "no module to load"))?;
                self.replace_locked(&mut control, &module, None)
            },
            None => self.connect_locked(&mut control, &endpoints, liveness),
        }
    }

    /// Connects Control and Telemetry and waits until telemetry flows, so
    /// nothing the composition does after unpausing goes unheard.
    fn connect_locked(
        &self,
        control: &mut ControlState,
        endpoints: &SessionEndpoints,
        liveness: Option<Liveness>,
    ) -> Result<()> {
        let retry = self.options.connect_retry();
        let channel =
            RequestChannel::connect(&endpoints.control, retry).start_context("connect control")?;
        control.control = Some(channel);
        let subscriber =
            Subscriber::connect(&endpoints.telemetry, retry).start_context("connect telemetry")?;

        let heard = Arc::new(Latch::new());
        self.handshake.lock().heard = Some(Arc::clone(&heard));
        let listener = TelemetryListener::spawn(
            subscriber,
            liveness,
            Arc::clone(&heard),
            self.listener_context(),
        )
        .start_context("telemetry listener")?;
        *self.listener.lock() = Some(listener);

        let timeout = self.options.startup_timeout();
        let heard_in_time = heard.wait_timeout(timeout);
        if let Some(reason) = self.handshake.lock().failure.take() {
            return Err(Error::start_failure("handshake", reason));
        }
        if !heard_in_time {
            return Err(Error::Timeout {
                operation: "first telemetry message",
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.exchange_locked(
            control,
            "slow heartbeat",
            &ControlRequest::SlowHeartbeat,
            Some(timeout),
        )?;
        tracing::debug!(control = %endpoints.control, "composition connected");
        Ok(())
    }

    fn listener_context(&self) -> ListenerContext {
        let me = self.me.clone();
        ListenerContext {
            delegate: Arc::clone(&self.delegate),
            fired_event: Arc::clone(&self.fired_event),
            options: Arc::clone(&self.options),
            stopping: Arc::clone(&self.stopping),
            on_lost_contact: Arc::new(move |reason| {
                if let Some(inner) = me.upgrade() {
                    inner.lose_contact(reason);
                }
            }),
        }
    }

    /// One Control exchange for a caller-facing operation. `Ok(None)` when
    /// the session is stopped or lost contact.
    fn request(
        &self,
        operation: &'static str,
        request: &ControlRequest,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        if !self.is_active() {
            tracing::debug!(operation, "session inactive; request skipped");
            return Ok(None);
        }
        self.run_while_draining(|| {
            let mut control = self.control.lock();
            self.exchange_locked(&mut control, operation, request, timeout)
        })
    }

    fn exchange_locked(
        &self,
        control: &mut ControlState,
        operation: &'static str,
        request: &ControlRequest,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>> {
        let Some(channel) = control.control.as_mut() else {
            return Ok(None);
        };
        tracing::debug!(operation, tag = ?request.tag(), "control request");
        let reply = match channel.request(&request.to_message(), timeout) {
            Ok(reply) => reply,
            Err(err) => {
                let err = Error::from_proto(operation, err);
                if err.breaks_contact() {
                    self.lose_contact(err.to_string());
                }
                return Err(err);
            },
        };
        let expected = u32::from(request.reply_tag());
        if reply.tag != expected {
            let err = Error::protocol_fault(
                operation,
                format!("expected reply tag {expected}, received {}", reply.tag),
            );
            self.lose_contact(err.to_string());
            return Err(err);
        }
        Ok(Some(reply))
    }

    fn pause(&self) -> Result<()> {
        if self
            .request("pause", &ControlRequest::Pause, None)?
            .is_some()
        {
            self.set_state(RunnerState::Paused);
        }
        Ok(())
    }

    fn unpause(&self) -> Result<()> {
        if self
            .request("unpause", &ControlRequest::Unpause, None)?
            .is_some()
        {
            self.set_state(RunnerState::Running);
        }
        Ok(())
    }

    fn replace_composition(&self, module: &Path, change_description: Option<&str>) -> Result<()> {
        if !self.mode.uses_loader() {
            return Err(Error::unsupported(
                "only loader sessions can replace their composition",
            ));
        }
        if !self.is_active() {
            return Ok(());
        }
        let was_running = *self.state.lock() == RunnerState::Running;
        let mut control = self.control.lock();
        if was_running {
            self.exchange_locked(&mut control, "pause", &ControlRequest::Pause, None)?;
            self.set_state(RunnerState::Paused);
        }
        if let Err(err) = self.replace_locked(&mut control, module, change_description) {
            drop(control);
            self.lose_contact(format!("replacing the composition failed: {err}"));
            return Err(err);
        }
        if was_running {
            self.exchange_locked(&mut control, "unpause", &ControlRequest::Unpause, None)?;
            self.set_state(RunnerState::Running);
        }
        Ok(())
    }

    /// Hands `module` to the loader along with the ledger's plans, then
    /// reconnects to the composition it started.
    fn replace_locked(
        &self,
        control: &mut ControlState,
        module: &Path,
        change_description: Option<&str>,
    ) -> Result<()> {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
        if let Some(channel) = control.control.take() {
            channel.close();
        }
        self.published_inputs.store(None);
        self.published_outputs.store(None);

        let (unload, load) = {
            let mut libraries = self.libraries.lock();
            let unload = libraries.dequeue_libraries_to_unload();
            let load = libraries.dequeue_libraries_to_load();
            (unload, load)
        };
        let request = LoaderRequest {
            module_path: module.display().to_string(),
            load: load.iter().map(|p| p.display().to_string()).collect(),
            unload: unload.iter().map(|p| p.display().to_string()).collect(),
            change_description: change_description.map(str::to_string),
        };
        tracing::info!(
            module = %module.display(),
            load = request.load.len(),
            unload = request.unload.len(),
            "replacing composition"
        );

        let outcome = self.send_replace(control, &request);
        self.libraries.lock().complete_load_attempt(match &outcome {
            Ok(()) => LoadAttempt::Loaded,
            Err(err) => LoadAttempt::Failed(err.to_string()),
        });
        outcome?;

        let previous = control.module.replace(module.to_path_buf());
        if let Some(previous) = previous
            && previous != module
            && self.options.delete_binaries_when_finished
        {
            delete_binary(&previous);
        }

        let endpoints = control
            .endpoints
            .clone()
            .ok_or_else(|| Error::operation("replace composition", "session has no endpoints"))?;
        let liveness = self.instance.lock().as_ref().and_then(|i| i.liveness());
        self.connect_locked(control, &endpoints, liveness)
    }

    fn send_replace(&self, control: &mut ControlState, request: &LoaderRequest) -> Result<()> {
        let loader = control
            .loader
            .as_mut()
            .ok_or_else(|| Error::operation("replace composition", "loader is not connected"))?;
        let reply = loader
            .request(&request.to_message(), None)
            .map_err(|err| Error::from_proto("replace composition", err))?;
        if reply.tag != u32::from(LoaderReplyTag::CompositionReplaced) {
            return Err(Error::protocol_fault(
                "replace composition",
                format!("unexpected loader reply tag {}", reply.tag),
            ));
        }
        let success = reply
            .reader()
            .boolean()
            .map_err(|err| Error::from_proto("replace composition", err))?;
        if !success {
            return Err(Error::ReplaceFailed {
                details: format!("the loader could not load `{}`", request.module_path),
            });
        }
        Ok(())
    }

    /// Latches lost contact, tells the delegate once and stops the session
    /// on a helper thread.
    fn lose_contact(&self, reason: String) {
        if !self.started.load(Ordering::SeqCst) || self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(%reason, "ignoring contact loss outside a running session");
            return;
        }
        {
            let state = self.state.lock();
            if *state == RunnerState::Starting {
                tracing::debug!(%reason, "contact lost during the start handshake");
                let mut handshake = self.handshake.lock();
                handshake.failure.get_or_insert(reason);
                if let Some(heard) = &handshake.heard {
                    heard.set();
                }
                return;
            }
        }
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(%reason, "lost contact with the composition");
        self.fired_event.release();
        self.delegate.dispatch(|d| d.lost_contact());

        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name("cascade-stop".to_string())
            .spawn(move || {
                if let Some(inner) = me.upgrade() {
                    inner.stop();
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn the stop thread");
        }
    }

    fn stop(&self) {
        let _serial = self.stop_lock.lock();
        {
            let mut state = self.state.lock();
            if !self.started.load(Ordering::SeqCst) || *state == RunnerState::Stopped {
                return;
            }
            *state = RunnerState::Stopping;
        }
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!("stopping composition");

        if !self.lost.load(Ordering::SeqCst) {
            self.run_while_draining(|| self.stop_handshake());
        }
        self.teardown();

        self.set_state(RunnerState::Stopped);
        self.fired_event.release();
        self.stopped.set();
        tracing::info!("composition stopped");
    }

    fn stop_handshake(&self) {
        let (timeout, timeout_secs) = if self.mode.is_in_process() {
            (None, -1)
        } else {
            let timeout = self.options.stop_timeout();
            (Some(timeout), timeout.as_secs().max(1) as i64)
        };
        let mut control = self.control.lock();
        if let Err(err) = self.exchange_locked(
            &mut control,
            "stop",
            &ControlRequest::Stop { timeout_secs },
            timeout,
        ) {
            tracing::warn!(error = %err, "composition did not acknowledge stop");
        }
    }

    /// Releases everything the session holds. Never fails.
    fn teardown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
        let instance = self.instance.lock().take();
        if let Some(mut instance) = instance {
            let grace = self.options.process_exit_grace();
            if let Err(err) = self.run_while_draining(|| instance.shutdown(grace)) {
                tracing::warn!(error = %err, "composition shutdown failed");
            }
        }

        let mut control = self.control.lock();
        if let Some(channel) = control.control.take() {
            channel.close();
        }
        if let Some(channel) = control.loader.take() {
            channel.close();
        }
        if let Some(module) = control.module.take()
            && self.options.delete_binaries_when_finished
        {
            delete_binary(&module);
        }
        control.endpoints = None;
        if let Some(dir) = control.session_dir.take()
            && let Err(err) = dir.close()
        {
            tracing::warn!(error = %err, "failed to remove the session directory");
        }
        drop(control);

        self.published_inputs.store(None);
        self.published_outputs.store(None);
        drop(std::mem::take(&mut *self.libraries.lock()));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Silence the listener's disconnect reports while fields drop.
        self.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Runner, RunnerBuilder, RunnerState};
    use crate::config::RunnerOptions;
    use crate::error::{Error, Result};
    use crate::supervisor::{CompositionHost, CompositionInstance, LaunchMode, LaunchSpec};

    struct RefusingHost;

    impl CompositionHost for RefusingHost {
        fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn CompositionInstance>> {
            Err(Error::start_failure("exec", "no such file"))
        }
    }

    fn refused_runner() -> Runner {
        RunnerBuilder::new(LaunchMode::Executable {
            executable: "/nonexistent/composition".into(),
        })
        .host(Arc::new(RefusingHost))
        .build()
        .expect("build")
    }

    #[test]
    fn failed_start_leaves_a_stopped_single_use_session() {
        let runner = refused_runner();
        let err = runner.start().expect_err("start fails");
        assert!(matches!(err, Error::StartFailure { stage: "exec", .. }));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(!runner.has_lost_contact());
        runner.wait_until_stopped();

        let again = runner.start_paused().expect_err("single use");
        assert!(matches!(again, Error::InvalidInput { .. }));
    }

    #[test]
    fn operations_before_start_are_no_ops() {
        let runner = refused_runner();
        runner.pause().expect("pause");
        runner.stop();
        assert!(runner.is_stopped());
        assert!(runner.published_input_ports().expect("ports").is_empty());
        runner.wait_until_stopped();
    }

    #[test]
    fn replace_requires_a_loader_session() {
        let runner = refused_runner();
        let err = runner
            .replace_composition("/tmp/next.so", None)
            .expect_err("unsupported");
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn invalid_options_are_rejected_at_build() {
        let options = RunnerOptions {
            startup_timeout_ms: 0,
            ..RunnerOptions::default()
        };
        let err = Runner::executable("/bin/true", options).err().expect("invalid");
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
