//! Launching and tearing down the supervised composition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cascade_protocol::Endpoint;

use crate::error::{Error, Result};

mod liveness;
mod module;
#[cfg(unix)]
mod process;

pub use liveness::{Liveness, LivenessNotifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run a composition executable in its own process.
    Executable { executable: PathBuf },
    /// Run the generic loader in its own process; the module is sent to it
    /// afterwards over the Loader-Control channel.
    Loader { loader: PathBuf, module: PathBuf },
    /// Load a composition module into the current process.
    Module { module: PathBuf },
}

impl LaunchMode {
    pub fn is_in_process(&self) -> bool {
        matches!(self, Self::Module { .. })
    }

    pub fn uses_loader(&self) -> bool {
        matches!(self, Self::Loader { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    pub control: Endpoint,
    pub telemetry: Endpoint,
    pub loader: Option<Endpoint>,
}

impl SessionEndpoints {
    /// Endpoints inside a private per-session directory.
    pub fn in_dir(dir: &Path, with_loader: bool) -> Self {
        Self {
            control: Endpoint::ipc(dir.join("control")),
            telemetry: Endpoint::ipc(dir.join("telemetry")),
            loader: with_loader.then(|| Endpoint::ipc(dir.join("loader"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub mode: LaunchMode,
    pub endpoints: SessionEndpoints,
    /// Working directory for the composition; relative paths in the
    /// composition resolve against it.
    pub source_dir: Option<PathBuf>,
    pub start_paused: bool,
    pub continue_if_runner_dies: bool,
    /// The executable (process mode) or module (in-process mode) is deleted
    /// at shutdown.
    pub delete_binaries: bool,
}

pub trait CompositionInstance: Send {
    fn pid(&self) -> Option<u32>;

    fn is_in_process(&self) -> bool;

    /// Completes when the composition's process tree has exited. `None` for
    /// in-process compositions.
    fn liveness(&self) -> Option<Liveness>;

    /// Releases the composition: waits up to `grace` for it to exit on its
    /// own, then forces it. Idempotent.
    fn shutdown(&mut self, grace: Duration) -> Result<()>;
}

pub trait CompositionHost: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn CompositionInstance>>;
}

/// Launches real processes and modules.
pub struct SystemHost;

pub fn default_composition_host() -> Arc<dyn CompositionHost> {
    Arc::new(SystemHost)
}

impl CompositionHost for SystemHost {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn CompositionInstance>> {
        match &spec.mode {
            LaunchMode::Module { module } => Ok(Box::new(module::load(module, spec)?)),
            LaunchMode::Executable { executable } => {
                let argv0 = display_name(executable);
                launch_process(executable, &argv0, spec)
            },
            LaunchMode::Loader { loader, module } => {
                let argv0 = display_name(module);
                launch_process(loader, &argv0, spec)
            },
        }
    }
}

#[cfg(unix)]
fn launch_process(
    program: &Path,
    argv0: &str,
    spec: &LaunchSpec,
) -> Result<Box<dyn CompositionInstance>> {
    Ok(Box::new(process::spawn(program, argv0, spec)?))
}

#[cfg(not(unix))]
fn launch_process(
    _program: &Path,
    _argv0: &str,
    _spec: &LaunchSpec,
) -> Result<Box<dyn CompositionInstance>> {
    Err(Error::unsupported(
        "separate-process compositions need a unix host",
    ))
}

/// What `ps` shows for the process: the composition's file stem.
fn display_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "composition".to_string())
}

pub(crate) fn delete_binary(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "failed to delete composition binary");
    }
}

pub(crate) fn ensure_file(path: &Path, what: &'static str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::not_found(what, path.display().to_string()))
    }
}
