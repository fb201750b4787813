//! Compositions loaded into the runner's own process.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use cascade_protocol::abi::{
    CompositionFiniFn, CompositionInitArgs, CompositionInitFn, FINI_SYMBOL, INIT_SYMBOL,
};
use libloading::{Library, Symbol};
use parking_lot::Mutex;

use super::{CompositionInstance, LaunchSpec, Liveness, delete_binary, ensure_file};
use crate::error::{Error, ErrorContext, Result};
use crate::event_loop::post_to_main_queue;

/// Paths currently mapped by some session in this process. Loading the same
/// path twice would hand back the already-initialized image.
fn loaded_paths() -> &'static Mutex<HashMap<PathBuf, usize>> {
    static LOADED: OnceLock<Mutex<HashMap<PathBuf, usize>>> = OnceLock::new();
    LOADED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A session's claim on a module file. A path some other session already
/// claimed is served from a private copy. Dropping the claim deregisters
/// the path and deletes files the claim owns.
struct ModuleFile {
    path: PathBuf,
    /// Set when `path` is a private copy or the caller asked for deletion.
    owns_file: bool,
}

impl ModuleFile {
    fn claim(module: &Path, delete_when_done: bool) -> Result<Self> {
        let mut loaded = loaded_paths().lock();
        let path = if loaded.contains_key(module) {
            duplicate_module(module).start_context("duplicate module")?
        } else {
            module.to_path_buf()
        };
        *loaded.entry(path.clone()).or_insert(0) += 1;
        let owns_file = path != module || delete_when_done;
        Ok(Self { path, owns_file })
    }
}

impl Drop for ModuleFile {
    fn drop(&mut self) {
        {
            let mut loaded = loaded_paths().lock();
            if let Some(count) = loaded.get_mut(&self.path) {
                *count -= 1;
                if *count == 0 {
                    loaded.remove(&self.path);
                }
            }
        }
        if self.owns_file {
            delete_binary(&self.path);
        }
    }
}

pub(crate) struct ModuleInstance {
    library: Option<Library>,
    /// Released after the library is closed.
    file: Option<ModuleFile>,
    previous_dir: Option<PathBuf>,
}

pub(crate) fn load(module: &Path, spec: &LaunchSpec) -> Result<ModuleInstance> {
    ensure_file(module, "composition module")?;

    let file = ModuleFile::claim(module, spec.delete_binaries)?;
    let path = file.path.clone();
    let mut instance = ModuleInstance {
        library: None,
        file: Some(file),
        previous_dir: None,
    };
    if let Some(dir) = &spec.source_dir {
        instance.previous_dir = std::env::current_dir().ok();
        std::env::set_current_dir(dir).map_err(|err| Error::io_at(dir, err))?;
    }

    // SAFETY: loading a composition module runs its initializers; the module
    // is trusted by the caller that asked for it.
    let library = unsafe { Library::new(&path) }.start_context("load module")?;
    let init = cstrings(spec)?;
    let args = CompositionInitArgs {
        control: init.control.as_ptr(),
        telemetry: init.telemetry.as_ptr(),
        change_description: std::ptr::null(),
        start_paused: spec.start_paused,
        continue_if_runner_dies: spec.continue_if_runner_dies,
        runner_pipe: -1,
        post_to_main: Some(post_to_main_queue),
    };
    {
        // SAFETY: the symbol type matches the composition ABI.
        let entry: Symbol<CompositionInitFn> =
            unsafe { library.get(INIT_SYMBOL) }.start_context("resolve init symbol")?;
        // SAFETY: `args` and the strings it points to outlive the call.
        let status = unsafe { entry(&args) };
        if status != 0 {
            return Err(Error::start_failure(
                "composition init",
                format!("`{}` returned {status}", path.display()),
            ));
        }
    }
    instance.library = Some(library);
    tracing::info!(module = %path.display(), "composition module loaded");
    Ok(instance)
}

struct InitStrings {
    control: CString,
    telemetry: CString,
}

fn cstrings(spec: &LaunchSpec) -> Result<InitStrings> {
    Ok(InitStrings {
        control: CString::new(spec.endpoints.control.to_string()).start_context("init arguments")?,
        telemetry: CString::new(spec.endpoints.telemetry.to_string())
            .start_context("init arguments")?,
    })
}

/// Copies the module next to itself under a fresh name.
fn duplicate_module(module: &Path) -> io::Result<PathBuf> {
    let dir = module.parent().unwrap_or_else(|| Path::new("."));
    let stem = module
        .file_stem()
        .map(|stem| format!("{}-", stem.to_string_lossy()))
        .unwrap_or_default();
    let suffix = module
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut copy = tempfile::Builder::new()
        .prefix(&stem)
        .suffix(&suffix)
        .tempfile_in(dir)?;
    io::copy(&mut std::fs::File::open(module)?, copy.as_file_mut())?;
    let (_, path) = copy.keep().map_err(|err| err.error)?;
    tracing::debug!(original = %module.display(), copy = %path.display(), "module already loaded; using a copy");
    Ok(path)
}

impl CompositionInstance for ModuleInstance {
    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn is_in_process(&self) -> bool {
        true
    }

    fn liveness(&self) -> Option<Liveness> {
        None
    }

    fn shutdown(&mut self, _grace: Duration) -> Result<()> {
        if let Some(library) = self.library.take() {
            // SAFETY: the symbol type matches the composition ABI.
            match unsafe { library.get::<CompositionFiniFn>(FINI_SYMBOL) } {
                // SAFETY: `fini` is called once, after the composition stopped.
                Ok(fini) => unsafe { fini() },
                Err(err) => tracing::debug!(error = %err, "module has no fini symbol"),
            }
            if let Err(err) = library.close() {
                tracing::warn!(error = %err, "failed to unload module");
            }
        }
        if let Some(dir) = self.previous_dir.take()
            && let Err(err) = std::env::set_current_dir(&dir)
        {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to restore working directory");
        }
        drop(self.file.take());
        Ok(())
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        let _ = self.shutdown(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ModuleFile, duplicate_module, load, loaded_paths};
    use crate::error::Error;
    use crate::supervisor::{LaunchMode, LaunchSpec, SessionEndpoints};

    fn is_registered(path: &Path) -> bool {
        loaded_paths().lock().contains_key(path)
    }

    fn spec(module: &Path, endpoints_dir: &Path) -> LaunchSpec {
        LaunchSpec {
            mode: LaunchMode::Module {
                module: module.to_path_buf(),
            },
            endpoints: SessionEndpoints::in_dir(endpoints_dir, false),
            source_dir: None,
            start_paused: true,
            continue_if_runner_dies: false,
            delete_binaries: false,
        }
    }

    #[test]
    fn second_claim_on_a_path_gets_an_owned_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("Counter.so");
        std::fs::write(&module, b"image").expect("write");

        let first = ModuleFile::claim(&module, false).expect("first claim");
        assert_eq!(first.path, module);
        assert!(!first.owns_file);

        let second = ModuleFile::claim(&module, false).expect("second claim");
        assert_ne!(second.path, module);
        assert!(second.owns_file);
        assert!(is_registered(&second.path));
        let copy = second.path.clone();

        drop(second);
        assert!(!copy.exists());
        assert!(!is_registered(&copy));
        assert!(is_registered(&module));

        drop(first);
        assert!(module.exists());
        assert!(!is_registered(&module));

        let again = ModuleFile::claim(&module, false).expect("claim after release");
        assert_eq!(again.path, module);
    }

    #[test]
    fn claim_deletes_the_original_when_asked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("Once.so");
        std::fs::write(&module, b"image").expect("write");

        drop(ModuleFile::claim(&module, true).expect("claim"));
        assert!(!module.exists());
        assert!(!is_registered(&module));
    }

    #[test]
    fn failed_load_releases_its_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("Broken.so");
        std::fs::write(&module, b"not a shared library").expect("write");
        let held = ModuleFile::claim(&module, false).expect("held");

        let err = load(&module, &spec(&module, dir.path())).err().expect("not loadable");
        assert!(matches!(err, Error::StartFailure { stage: "load module", .. }), "{err:?}");
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "so"))
            .count();
        assert_eq!(leftovers, 1, "the private copy is deleted");
        assert_eq!(loaded_paths().lock().get(&module).copied(), Some(1));

        drop(held);
        assert!(!is_registered(&module));
    }

    #[test]
    fn missing_module_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("Missing.so");
        let err = load(&module, &spec(&module, dir.path())).err().expect("missing");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn duplicate_keeps_extension_and_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = dir.path().join("Spin.so");
        std::fs::write(&module, b"not really elf").expect("write");

        let copy = duplicate_module(&module).expect("duplicate");
        assert_ne!(copy, module);
        assert_eq!(copy.parent(), Some(dir.path()));
        assert_eq!(copy.extension().and_then(|e| e.to_str()), Some("so"));
        assert!(
            copy.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("Spin-"))
        );
        assert_eq!(std::fs::read(&copy).expect("read"), b"not really elf");
    }
}
