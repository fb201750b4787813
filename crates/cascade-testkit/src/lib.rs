//! Test doubles for composition sessions.
//!
//! [`FakeComposition`] speaks the Control and Telemetry protocols the way a
//! compiled composition does. [`FakeHost`] launches it on threads so runner
//! tests need no composition binaries; the `cascade-fake-composition`
//! binary runs the same composition as its own process.

pub mod composition;
pub mod host;

pub use composition::{FakeComposition, FakeOptions};
pub use host::{FakeHost, Launched};
