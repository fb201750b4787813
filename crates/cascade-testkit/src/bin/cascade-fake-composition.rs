//! Runs a [`FakeComposition`] as a standalone composition executable.

use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use cascade_protocol::CompositionArgs;
use cascade_testkit::{FakeComposition, FakeOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let args = CompositionArgs::from_env().context("parse composition arguments")?;
    let composition = FakeComposition::serve(&args.control, &args.telemetry, FakeOptions::default())
        .context("serve composition")?;

    if let Some(fd) = args.runner_pipe
        && !args.continue_if_runner_dies
    {
        // SAFETY: the runner passed us this descriptor and nothing else owns it.
        let mut pipe = unsafe { File::from_raw_fd(fd) };
        thread::Builder::new()
            .name("fake-runner-watch".to_string())
            .spawn(move || {
                let mut buf = [0u8; 16];
                while matches!(pipe.read(&mut buf), Ok(n) if n > 0) {}
                std::process::exit(0);
            })
            .context("spawn runner watch thread")?;
    }

    // The liveness pipe stays open until exit.
    while !composition.wait_for_stop(Duration::from_secs(1)) {}
    composition.shutdown();
    Ok(())
}
