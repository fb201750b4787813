//! A [`CompositionHost`] that runs [`FakeComposition`]s on threads instead
//! of launching binaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use cascade_protocol::loader::replaced_reply;
use cascade_protocol::{Endpoint, LoaderRequest, ReplyListener};
use cascade_runner::{
    CompositionHost, CompositionInstance, Error, LaunchSpec, Liveness, LivenessNotifier, Result,
    SessionEndpoints,
};
use parking_lot::Mutex;

use crate::composition::{FakeComposition, FakeOptions};

/// One composition the host launched.
#[derive(Clone)]
pub struct Launched {
    composition: Arc<Mutex<FakeComposition>>,
    notifier: Arc<Mutex<Option<LivenessNotifier>>>,
    in_process: bool,
}

impl Launched {
    /// The composition currently serving the session. Loader sessions get a
    /// new one on every replacement.
    pub fn composition(&self) -> FakeComposition {
        self.composition.lock().clone()
    }

    pub fn is_in_process(&self) -> bool {
        self.in_process
    }

    /// Ends the composition without a stop handshake and reports the
    /// process tree as exited.
    pub fn crash(&self) {
        self.composition.lock().shutdown();
        self.notifier.lock().take();
    }
}

#[derive(Default)]
struct HostState {
    launched: Vec<Launched>,
    replacements: Vec<LoaderRequest>,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    options: FakeOptions,
    state: Arc<Mutex<HostState>>,
    refuse_replacements: Arc<AtomicBool>,
}

impl FakeHost {
    pub fn new(options: FakeOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn launched(&self) -> Vec<Launched> {
        self.state.lock().launched.clone()
    }

    pub fn latest(&self) -> Option<Launched> {
        self.state.lock().launched.last().cloned()
    }

    /// Loader requests received so far, oldest first.
    pub fn replacements(&self) -> Vec<LoaderRequest> {
        self.state.lock().replacements.clone()
    }

    /// Every later loader request is answered with failure.
    pub fn refuse_replacements(&self) {
        self.refuse_replacements.store(true, Ordering::SeqCst);
    }
}

impl CompositionHost for FakeHost {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn CompositionInstance>> {
        let endpoints = spec.endpoints.clone();
        // A loader runs nothing until the first replace request.
        let composition = if endpoints.loader.is_some() {
            FakeComposition::idle()
        } else {
            serve(&endpoints.control, &endpoints.telemetry, &self.options)?
        };
        let composition = Arc::new(Mutex::new(composition));
        let (notifier, liveness) = Liveness::channel();
        let launched = Launched {
            composition,
            notifier: Arc::new(Mutex::new(Some(notifier))),
            in_process: spec.mode.is_in_process(),
        };

        if let Some(loader) = endpoints.loader.clone() {
            let listener = ReplyListener::bind(&loader)
                .map_err(|err| Error::start_failure("loader", err.to_string()))?;
            let host = self.clone();
            let launched = launched.clone();
            thread::Builder::new()
                .name("fake-loader".to_string())
                .spawn(move || host.serve_loader(&listener, &endpoints, &launched))
                .map_err(|err| Error::start_failure("loader", err.to_string()))?;
        }

        self.state.lock().launched.push(launched.clone());
        Ok(Box::new(FakeInstance { launched, liveness }))
    }
}

impl FakeHost {
    fn serve_loader(
        &self,
        listener: &ReplyListener,
        endpoints: &SessionEndpoints,
        launched: &Launched,
    ) {
        let Ok(mut channel) = listener.accept() else {
            return;
        };
        while let Ok(Some(message)) = channel.recv(None) {
            let Ok(request) = LoaderRequest::from_message(&message) else {
                let _ = channel.send(&replaced_reply(false));
                continue;
            };
            self.state.lock().replacements.push(request);
            launched.composition.lock().shutdown();
            let success = !self.refuse_replacements.load(Ordering::SeqCst)
                && match serve(&endpoints.control, &endpoints.telemetry, &self.options) {
                    Ok(composition) => {
                        *launched.composition.lock() = composition;
                        true
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "fake loader could not start the module");
                        false
                    },
                };
            if channel.send(&replaced_reply(success)).is_err() {
                return;
            }
        }
    }
}

fn serve(control: &Endpoint, telemetry: &Endpoint, options: &FakeOptions) -> Result<FakeComposition> {
    FakeComposition::serve(control, telemetry, options.clone())
        .map_err(|err| Error::start_failure("fake composition", err.to_string()))
}

struct FakeInstance {
    launched: Launched,
    liveness: Liveness,
}

impl CompositionInstance for FakeInstance {
    fn pid(&self) -> Option<u32> {
        (!self.launched.in_process).then(std::process::id)
    }

    fn is_in_process(&self) -> bool {
        self.launched.in_process
    }

    fn liveness(&self) -> Option<Liveness> {
        Some(self.liveness.clone())
    }

    fn shutdown(&mut self, _grace: Duration) -> Result<()> {
        self.launched.crash();
        Ok(())
    }
}

impl Drop for FakeInstance {
    fn drop(&mut self) {
        self.launched.crash();
    }
}
