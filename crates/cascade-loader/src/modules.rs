use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use cascade_protocol::abi::{
    CompositionFiniFn, CompositionInitArgs, CompositionInitFn, FINI_SYMBOL, INIT_SYMBOL,
    MainJobFn,
};
use cascade_protocol::{CompositionArgs, LoaderRequest};
use crossbeam_channel::{Receiver, Sender};
use libloading::{Library, Symbol};

/// A job a module posted to the loader's main thread.
pub struct MainJob {
    job: MainJobFn,
    context: *mut c_void,
}

// SAFETY: the module promises `context` stays valid until `job` runs on
// the main thread.
unsafe impl Send for MainJob {}

impl MainJob {
    pub fn run(self) {
        // SAFETY: `job` and `context` were handed over together.
        unsafe { (self.job)(self.context) }
    }
}

fn main_queue() -> &'static (Sender<MainJob>, Receiver<MainJob>) {
    static QUEUE: OnceLock<(Sender<MainJob>, Receiver<MainJob>)> = OnceLock::new();
    QUEUE.get_or_init(crossbeam_channel::unbounded)
}

pub fn main_jobs() -> &'static Receiver<MainJob> {
    &main_queue().1
}

unsafe extern "C" fn post_to_main(job: MainJobFn, context: *mut c_void) {
    let _ = main_queue().0.send(MainJob { job, context });
}

/// Libraries and the composition module currently mapped into the loader.
pub struct ModuleHost {
    args: CompositionArgs,
    libraries: HashMap<String, Library>,
    module: Option<(String, Library)>,
}

impl ModuleHost {
    pub fn new(args: CompositionArgs) -> Self {
        Self {
            args,
            libraries: HashMap::new(),
            module: None,
        }
    }

    /// Applies one replace request. On error the previous module is gone
    /// and the loader runs nothing.
    pub fn replace(&mut self, request: &LoaderRequest) -> Result<()> {
        self.unload_module();
        for path in &request.unload {
            match self.libraries.remove(path) {
                Some(library) => {
                    library
                        .close()
                        .with_context(|| format!("unload library {path}"))?;
                    tracing::debug!(%path, "library unloaded");
                },
                None => tracing::warn!(%path, "asked to unload a library that is not loaded"),
            }
        }
        for path in &request.load {
            if self.libraries.contains_key(path) {
                continue;
            }
            let library = open_global(path).with_context(|| format!("load library {path}"))?;
            self.libraries.insert(path.clone(), library);
            tracing::debug!(%path, "library loaded");
        }
        self.load_module(&request.module_path, request.change_description.as_deref())
    }

    fn load_module(&mut self, path: &str, change_description: Option<&str>) -> Result<()> {
        // SAFETY: the runner only sends modules it built for this loader.
        let library =
            unsafe { Library::new(path) }.with_context(|| format!("load module {path}"))?;
        let control = CString::new(self.args.control.to_string())?;
        let telemetry = CString::new(self.args.telemetry.to_string())?;
        let change_description = change_description.map(CString::new).transpose()?;
        let init_args = CompositionInitArgs {
            control: control.as_ptr(),
            telemetry: telemetry.as_ptr(),
            change_description: change_description
                .as_ref()
                .map_or(std::ptr::null(), |text| text.as_ptr()),
            start_paused: true,
            continue_if_runner_dies: self.args.continue_if_runner_dies,
            runner_pipe: self.args.runner_pipe.unwrap_or(-1),
            post_to_main: Some(post_to_main),
        };
        let status = {
            // SAFETY: the symbol type matches the composition ABI.
            let init: Symbol<CompositionInitFn> = unsafe { library.get(INIT_SYMBOL) }
                .with_context(|| format!("module {path} has no init symbol"))?;
            // SAFETY: the arguments outlive the call.
            unsafe { init(&init_args) }
        };
        if status != 0 {
            return Err(anyhow!("module {path} init returned {status}"));
        }
        tracing::info!(module = %path, "composition module running");
        self.module = Some((path.to_string(), library));
        Ok(())
    }

    pub fn unload_module(&mut self) {
        let Some((path, library)) = self.module.take() else {
            return;
        };
        // SAFETY: the symbol type matches the composition ABI.
        match unsafe { library.get::<CompositionFiniFn>(FINI_SYMBOL) } {
            // SAFETY: called once, before the module is unmapped.
            Ok(fini) => unsafe { fini() },
            Err(err) => tracing::debug!(module = %path, error = %err, "module has no fini symbol"),
        }
        if let Err(err) = library.close() {
            tracing::warn!(module = %path, error = %err, "failed to unload module");
        }
    }
}

impl Drop for ModuleHost {
    fn drop(&mut self) {
        self.unload_module();
    }
}

/// Dependency libraries export their symbols to everything loaded later.
#[cfg(unix)]
fn open_global(path: &str) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    // SAFETY: loading runs the library's initializers; the runner vouches
    // for what it asks to load.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_global(path: &str) -> Result<Library, libloading::Error> {
    // SAFETY: as above.
    unsafe { Library::new(path) }
}

#[cfg(test)]
mod tests {
    use cascade_protocol::{CompositionArgs, Endpoint, LoaderRequest};

    use super::ModuleHost;

    #[test]
    fn missing_library_fails_the_replace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = ModuleHost::new(CompositionArgs::new(
            Endpoint::ipc(dir.path().join("control")),
            Endpoint::ipc(dir.path().join("telemetry")),
        ));
        let request = LoaderRequest {
            module_path: dir.path().join("module.so").display().to_string(),
            load: vec![dir.path().join("missing.so").display().to_string()],
            unload: vec!["never-loaded.so".to_string()],
            change_description: None,
        };
        let err = host.replace(&request).expect_err("missing library");
        assert!(format!("{err:#}").contains("missing.so"));
    }
}
