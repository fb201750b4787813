//! Runtime controller for composition sessions.
//!
//! Start with [`Runner`]: it launches a composition (in this process, as
//! its own executable, or through the generic loader), drives it over the
//! Control channel and reports its telemetry to a [`RunnerDelegate`].

pub mod config;
pub mod delegate;
pub mod error;
pub mod event_loop;
pub mod ledger;
mod listener;
pub mod port;
pub mod runner;
pub mod signal;
pub mod supervisor;

pub use cascade_protocol::PortUpdate;
pub use config::RunnerOptions;
pub use delegate::{DelegateQueue, RunnerDelegate};
pub use error::{Error, ErrorContext, Result};
pub use event_loop::{EventLoop, MainJob, MainQueue, drain_main_queue, run_on_main_thread};
pub use ledger::{LibraryPool, LibrarySpec, LoadAttempt, RunningLibrarySet};
pub use port::PublishedPort;
pub use runner::{Runner, RunnerBuilder, RunnerState};
pub use signal::{Latch, SaturatingSignal};
pub use supervisor::{
    CompositionHost, CompositionInstance, LaunchMode, LaunchSpec, Liveness, LivenessNotifier,
    SessionEndpoints, SystemHost, default_composition_host,
};
