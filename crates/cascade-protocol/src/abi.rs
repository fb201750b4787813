//! C ABI a composition module exports so it can run inside the runner's
//! process or inside the loader.

use std::ffi::{c_char, c_int, c_void};

/// Main-queue callback the host hands to an in-process composition.
pub type MainJobFn = unsafe extern "C" fn(context: *mut c_void);

/// Posts `job(context)` to the host's event loop.
pub type PostToMainFn = unsafe extern "C" fn(job: MainJobFn, context: *mut c_void);

/// Arguments for [`INIT_SYMBOL`]. Strings are NUL-terminated and only valid
/// for the duration of the call.
#[repr(C)]
pub struct CompositionInitArgs {
    pub control: *const c_char,
    pub telemetry: *const c_char,
    /// Null when there is no change description.
    pub change_description: *const c_char,
    pub start_paused: bool,
    pub continue_if_runner_dies: bool,
    /// Read end of the runner pipe, or -1 when the composition shares the
    /// runner's process.
    pub runner_pipe: c_int,
    /// Null when the host has no event loop to offer.
    pub post_to_main: Option<PostToMainFn>,
}

/// `int cascade_composition_init(const CompositionInitArgs *)`; zero on
/// success. The composition binds its Control and Telemetry endpoints
/// before returning.
pub type CompositionInitFn = unsafe extern "C" fn(args: *const CompositionInitArgs) -> c_int;

/// `void cascade_composition_fini(void)`; releases everything `init`
/// created. Called before the module is unloaded.
pub type CompositionFiniFn = unsafe extern "C" fn();

pub const INIT_SYMBOL: &[u8] = b"cascade_composition_init\0";
pub const FINI_SYMBOL: &[u8] = b"cascade_composition_fini\0";
