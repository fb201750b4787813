//! Book-keeping for the auxiliary libraries a live-reloadable composition
//! links against.
//!
//! Libraries come from two disjoint pools: resource libraries (compiled from
//! the composition's own sources, optionally owned and deleted by the set)
//! and cache libraries (pre-linked bundles). Each pool has a loaded list and
//! two staging lists. Only the `dequeue_*` calls move paths between staging
//! and loaded, and they return the plans sent to the loader.
//!
//! Every replace reloads the unloadable libraries that stay loaded, so an
//! unload plan names all of them and the following load plan names them
//! again, in dependency order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryPool {
    Resource,
    Cache,
}

impl LibraryPool {
    fn name(self) -> &'static str {
        match self {
            Self::Resource => "resource library",
            Self::Cache => "cache library",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySpec {
    pub path: PathBuf,
    /// Symbols defined by the library.
    pub provides: BTreeSet<String>,
    /// Symbols the library expects another library to define.
    pub requires: BTreeSet<String>,
    pub unloadable: bool,
}

impl LibrarySpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            provides: BTreeSet::new(),
            requires: BTreeSet::new(),
            unloadable: true,
        }
    }

    pub fn providing<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn requiring<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn permanent(mut self) -> Self {
        self.unloadable = false;
        self
    }
}

/// Outcome delivered to everyone waiting on the next load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadAttempt {
    Loaded,
    Failed(String),
    /// The set was dropped before any load was attempted.
    Abandoned,
}

#[derive(Default)]
struct Pool {
    loaded: Vec<PathBuf>,
    to_load: Vec<PathBuf>,
    to_unload: Vec<PathBuf>,
}

impl Pool {
    fn is_loaded(&self, path: &Path) -> bool {
        self.loaded.iter().any(|p| p == path)
    }

    fn is_queued_to_unload(&self, path: &Path) -> bool {
        self.to_unload.iter().any(|p| p == path)
    }

    fn is_queued_to_load(&self, path: &Path) -> bool {
        self.to_load.iter().any(|p| p == path)
    }

    fn knows(&self, path: &Path) -> bool {
        self.is_loaded(path) || self.is_queued_to_load(path)
    }
}

#[derive(Default)]
pub struct RunningLibrarySet {
    resource: Pool,
    cache: Pool,
    loaded_specs: BTreeMap<PathBuf, LibrarySpec>,
    pending_specs: BTreeMap<PathBuf, LibrarySpec>,
    external_libraries: BTreeSet<PathBuf>,
    external_frameworks: BTreeSet<PathBuf>,
    delete_resource_libraries: bool,
    load_watchers: Vec<oneshot::Sender<LoadAttempt>>,
}

impl RunningLibrarySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, resource library files are deleted once unloaded and when
    /// the set is dropped.
    pub fn set_delete_resource_libraries(&mut self, delete: bool) {
        self.delete_resource_libraries = delete;
    }

    pub fn enqueue_resource_library_to_load(&mut self, spec: LibrarySpec) -> Result<bool> {
        self.enqueue_to_load(LibraryPool::Resource, spec)
    }

    pub fn enqueue_cache_library_to_load(&mut self, spec: LibrarySpec) -> Result<bool> {
        self.enqueue_to_load(LibraryPool::Cache, spec)
    }

    /// Queues `spec` unless it is already loaded and staying loaded.
    /// Returns whether it was queued.
    fn enqueue_to_load(&mut self, pool: LibraryPool, spec: LibrarySpec) -> Result<bool> {
        let other = match pool {
            LibraryPool::Resource => &self.cache,
            LibraryPool::Cache => &self.resource,
        };
        if other.knows(&spec.path) {
            return Err(Error::conflict(other_pool(pool).name(), spec.path.display().to_string()));
        }

        let target = self.pool_mut(pool);
        let needs_load = !target.is_loaded(&spec.path) || target.is_queued_to_unload(&spec.path);
        if !needs_load || target.is_queued_to_load(&spec.path) {
            return Ok(false);
        }
        target.to_load.push(spec.path.clone());
        tracing::debug!(
            pool = pool.name(),
            path = %spec.path.display(),
            unloadable = spec.unloadable,
            "library queued to load"
        );
        self.pending_specs.insert(spec.path.clone(), spec);
        Ok(true)
    }

    /// Queues the loaded library providing `symbol` for unloading. A library
    /// that cannot be unloaded is left alone. Returns the queued path.
    pub fn enqueue_library_containing_dependency_to_unload(
        &mut self,
        symbol: &str,
    ) -> Option<PathBuf> {
        let spec = self
            .loaded_specs
            .values()
            .find(|spec| spec.provides.contains(symbol))?;
        if !spec.unloadable {
            tracing::warn!(
                symbol,
                path = %spec.path.display(),
                "library containing dependency can't be unloaded"
            );
            return None;
        }
        let path = spec.path.clone();
        for pool in [&mut self.resource, &mut self.cache] {
            if pool.is_loaded(&path) && !pool.is_queued_to_unload(&path) {
                pool.to_unload.push(path.clone());
            }
        }
        Some(path)
    }

    /// Produces the load plan, dependencies first, and promotes everything
    /// queued to loaded. Call after [`Self::dequeue_libraries_to_unload`].
    pub fn dequeue_libraries_to_load(&mut self) -> Vec<PathBuf> {
        let mut plan = Vec::new();
        for pool in [&self.cache, &self.resource] {
            plan.extend(
                pool.loaded
                    .iter()
                    .filter(|path| self.is_unloadable(path))
                    .cloned(),
            );
            plan.extend(pool.to_load.iter().cloned());
        }

        let mut seen = BTreeSet::new();
        plan.retain(|path| seen.insert(path.clone()));

        let specs = std::mem::take(&mut self.pending_specs);
        self.loaded_specs.extend(specs);
        for pool in [&mut self.resource, &mut self.cache] {
            let queued = std::mem::take(&mut pool.to_load);
            for path in queued {
                if !pool.is_loaded(&path) {
                    pool.loaded.push(path);
                }
            }
        }

        let plan = self.dependency_order(plan);
        tracing::debug!(count = plan.len(), "library load plan");
        plan
    }

    /// Produces the unload plan, dependents first, and drops the libraries
    /// queued for unloading from the loaded lists.
    pub fn dequeue_libraries_to_unload(&mut self) -> Vec<PathBuf> {
        let resource_removed = std::mem::take(&mut self.resource.to_unload);
        let cache_removed = std::mem::take(&mut self.cache.to_unload);

        let mut load_ordered = Vec::new();
        for (pool, removed) in [
            (&self.cache, &cache_removed),
            (&self.resource, &resource_removed),
        ] {
            load_ordered.extend(
                pool.loaded
                    .iter()
                    .filter(|path| !removed.contains(*path) && self.is_unloadable(path))
                    .cloned(),
            );
            load_ordered.extend(removed.iter().cloned());
        }
        let mut plan = self.dependency_order(load_ordered);
        plan.reverse();

        for path in resource_removed.iter().chain(&cache_removed) {
            self.loaded_specs.remove(path);
        }
        self.resource.loaded.retain(|p| !resource_removed.contains(p));
        self.cache.loaded.retain(|p| !cache_removed.contains(p));
        if self.delete_resource_libraries {
            for path in &resource_removed {
                delete_owned_file(path);
            }
        }

        tracing::debug!(count = plan.len(), "library unload plan");
        plan
    }

    pub fn non_unloadable_libraries_loaded(&self) -> Vec<PathBuf> {
        self.loaded_paths()
            .filter(|path| !self.is_unloadable(path))
            .cloned()
            .collect()
    }

    /// Unloadable libraries that are loaded and not queued for unloading.
    pub fn unloadable_libraries_loaded(&self) -> Vec<PathBuf> {
        self.cache
            .loaded
            .iter()
            .filter(|path| !self.cache.is_queued_to_unload(path))
            .chain(
                self.resource
                    .loaded
                    .iter()
                    .filter(|path| !self.resource.is_queued_to_unload(path)),
            )
            .filter(|path| self.is_unloadable(path))
            .cloned()
            .collect()
    }

    /// Symbols provided by every library that is loaded and staying loaded.
    pub fn dependencies_loaded(&self) -> BTreeSet<String> {
        let staying = self
            .non_unloadable_libraries_loaded()
            .into_iter()
            .chain(self.unloadable_libraries_loaded());
        let mut symbols = BTreeSet::new();
        for path in staying {
            if let Some(spec) = self.loaded_specs.get(&path) {
                symbols.extend(spec.provides.iter().cloned());
            }
        }
        symbols
    }

    pub fn add_external_libraries<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) {
        self.external_libraries.extend(paths);
    }

    pub fn add_external_frameworks<I: IntoIterator<Item = PathBuf>>(&mut self, paths: I) {
        self.external_frameworks.extend(paths);
    }

    pub fn external_libraries(&self) -> &BTreeSet<PathBuf> {
        &self.external_libraries
    }

    pub fn external_frameworks(&self) -> &BTreeSet<PathBuf> {
        &self.external_frameworks
    }

    /// Resolves once the next load attempt finishes, or with
    /// [`LoadAttempt::Abandoned`] if the set is dropped first.
    pub fn after_load_attempted(&mut self) -> oneshot::Receiver<LoadAttempt> {
        let (tx, rx) = oneshot::channel();
        self.load_watchers.push(tx);
        rx
    }

    pub fn complete_load_attempt(&mut self, outcome: LoadAttempt) {
        for watcher in self.load_watchers.drain(..) {
            let _ = watcher.send(outcome.clone());
        }
    }

    fn pool_mut(&mut self, pool: LibraryPool) -> &mut Pool {
        match pool {
            LibraryPool::Resource => &mut self.resource,
            LibraryPool::Cache => &mut self.cache,
        }
    }

    fn loaded_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.cache.loaded.iter().chain(self.resource.loaded.iter())
    }

    fn spec(&self, path: &Path) -> Option<&LibrarySpec> {
        self.loaded_specs
            .get(path)
            .or_else(|| self.pending_specs.get(path))
    }

    fn is_unloadable(&self, path: &Path) -> bool {
        self.spec(path).is_some_and(|spec| spec.unloadable)
    }

    fn dependency_order(&self, plan: Vec<PathBuf>) -> Vec<PathBuf> {
        let specs = plan
            .iter()
            .map(|path| self.spec(path).cloned())
            .collect::<Vec<_>>();
        stable_dependency_order(plan, &specs)
    }
}

impl Drop for RunningLibrarySet {
    fn drop(&mut self) {
        self.complete_load_attempt(LoadAttempt::Abandoned);
        if self.delete_resource_libraries {
            for path in &self.resource.loaded {
                delete_owned_file(path);
            }
        }
    }
}

fn other_pool(pool: LibraryPool) -> LibraryPool {
    match pool {
        LibraryPool::Resource => LibraryPool::Cache,
        LibraryPool::Cache => LibraryPool::Resource,
    }
}

fn delete_owned_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "failed to delete resource library");
    }
}

/// Orders `plan` so every library follows the libraries in the plan that
/// provide its required symbols, otherwise keeping the given order. Cycles
/// are broken by emitting the earliest remaining library.
fn stable_dependency_order(plan: Vec<PathBuf>, specs: &[Option<LibrarySpec>]) -> Vec<PathBuf> {
    let count = plan.len();
    let depends_on = |a: usize, b: usize| -> bool {
        match (&specs[a], &specs[b]) {
            (Some(dependent), Some(dependency)) => {
                a != b && dependent.requires.iter().any(|s| dependency.provides.contains(s))
            },
            _ => false,
        }
    };

    let mut emitted = vec![false; count];
    let mut order = Vec::with_capacity(count);
    while order.len() < count {
        let ready = (0..count).find(|&i| {
            !emitted[i] && (0..count).all(|j| emitted[j] || !depends_on(i, j))
        });
        let next = match ready {
            Some(i) => i,
            None => {
                let Some(i) = (0..count).find(|&i| !emitted[i]) else {
                    break;
                };
                tracing::warn!(path = %plan[i].display(), "library dependency cycle");
                i
            },
        };
        emitted[next] = true;
        order.push(next);
    }
    order.into_iter().map(|i| plan[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{LibrarySpec, LoadAttempt, RunningLibrarySet};
    use crate::error::Error;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    fn a_and_b() -> (LibrarySpec, LibrarySpec) {
        let a = LibrarySpec::new("/lib/a.so")
            .providing(["a_fn"])
            .requiring(["b_fn"]);
        let b = LibrarySpec::new("/lib/b.so").providing(["b_fn"]);
        (a, b)
    }

    #[test]
    fn load_plan_puts_dependencies_first_and_unload_plan_reverses() {
        let (a, b) = a_and_b();
        let mut set = RunningLibrarySet::new();
        set.enqueue_resource_library_to_load(a).expect("queue a");
        set.enqueue_resource_library_to_load(b).expect("queue b");

        assert!(set.dequeue_libraries_to_unload().is_empty());
        assert_eq!(set.dequeue_libraries_to_load(), paths(&["/lib/b.so", "/lib/a.so"]));

        set.enqueue_library_containing_dependency_to_unload("b_fn");
        set.enqueue_library_containing_dependency_to_unload("a_fn");
        assert_eq!(set.dequeue_libraries_to_unload(), paths(&["/lib/a.so", "/lib/b.so"]));
        assert!(set.dequeue_libraries_to_load().is_empty());
        assert!(set.unloadable_libraries_loaded().is_empty());
    }

    #[test]
    fn surviving_unloadable_libraries_are_reloaded_on_every_replace() {
        let (a, b) = a_and_b();
        let mut set = RunningLibrarySet::new();
        set.enqueue_cache_library_to_load(b).expect("queue b");
        set.enqueue_resource_library_to_load(a).expect("queue a");
        set.dequeue_libraries_to_unload();
        set.dequeue_libraries_to_load();

        assert_eq!(set.dequeue_libraries_to_unload(), paths(&["/lib/a.so", "/lib/b.so"]));
        assert_eq!(set.dequeue_libraries_to_load(), paths(&["/lib/b.so", "/lib/a.so"]));
    }

    #[test]
    fn permanent_library_is_never_queued_for_unload() {
        let mut set = RunningLibrarySet::new();
        set.enqueue_cache_library_to_load(
            LibrarySpec::new("/lib/core.so").providing(["core"]).permanent(),
        )
        .expect("queue");
        set.dequeue_libraries_to_load();

        assert_eq!(set.enqueue_library_containing_dependency_to_unload("core"), None);
        assert!(set.dequeue_libraries_to_unload().is_empty());
        assert_eq!(set.non_unloadable_libraries_loaded(), paths(&["/lib/core.so"]));
        assert!(set.dependencies_loaded().contains("core"));
    }

    #[test]
    fn already_loaded_library_is_not_queued_twice() {
        let mut set = RunningLibrarySet::new();
        let spec = LibrarySpec::new("/lib/x.so").providing(["x"]);
        assert!(set.enqueue_resource_library_to_load(spec.clone()).expect("first"));
        set.dequeue_libraries_to_load();
        assert!(!set.enqueue_resource_library_to_load(spec.clone()).expect("loaded"));

        set.enqueue_library_containing_dependency_to_unload("x");
        assert!(set.enqueue_resource_library_to_load(spec).expect("queued to unload"));
    }

    #[test]
    fn pools_are_disjoint() {
        let mut set = RunningLibrarySet::new();
        set.enqueue_resource_library_to_load(LibrarySpec::new("/lib/x.so"))
            .expect("resource");
        let err = set
            .enqueue_cache_library_to_load(LibrarySpec::new("/lib/x.so"))
            .expect_err("conflict");
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn dependency_cycle_still_emits_every_library() {
        let mut set = RunningLibrarySet::new();
        set.enqueue_resource_library_to_load(
            LibrarySpec::new("/lib/p.so").providing(["p"]).requiring(["q"]),
        )
        .expect("p");
        set.enqueue_resource_library_to_load(
            LibrarySpec::new("/lib/q.so").providing(["q"]).requiring(["p"]),
        )
        .expect("q");
        let mut plan = set.dequeue_libraries_to_load();
        plan.sort();
        assert_eq!(plan, paths(&["/lib/p.so", "/lib/q.so"]));
    }

    #[test]
    fn owned_resource_libraries_are_deleted_when_unloaded_and_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unloaded = dir.path().join("unloaded.so");
        let kept = dir.path().join("kept.so");
        std::fs::write(&unloaded, b"x").expect("write");
        std::fs::write(&kept, b"x").expect("write");

        let mut set = RunningLibrarySet::new();
        set.set_delete_resource_libraries(true);
        set.enqueue_resource_library_to_load(LibrarySpec::new(&unloaded).providing(["u"]))
            .expect("queue");
        set.enqueue_resource_library_to_load(LibrarySpec::new(&kept).providing(["k"]))
            .expect("queue");
        set.dequeue_libraries_to_load();

        set.enqueue_library_containing_dependency_to_unload("u");
        set.dequeue_libraries_to_unload();
        assert!(!unloaded.exists());
        assert!(kept.exists());

        drop(set);
        assert!(!kept.exists());
    }

    #[test]
    fn load_watchers_are_resolved_exactly_once_even_on_teardown() {
        let mut set = RunningLibrarySet::new();
        let first = set.after_load_attempted();
        set.complete_load_attempt(LoadAttempt::Failed("link error".into()));
        let second = set.after_load_attempted();
        drop(set);

        assert_eq!(
            first.blocking_recv().expect("first"),
            LoadAttempt::Failed("link error".into())
        );
        assert_eq!(second.blocking_recv().expect("second"), LoadAttempt::Abandoned);
    }
}
