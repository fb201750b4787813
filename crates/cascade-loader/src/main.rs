//! Generic composition loader.
//!
//! Started by the runner in place of a composition executable. It serves
//! the Loader-Control channel and swaps composition modules in and out of
//! its own process on request, so a composition can be replaced without
//! restarting the process that hosts it.

mod modules;

use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::thread;

use anyhow::{Context, Result, anyhow};
use cascade_protocol::loader::replaced_reply;
use cascade_protocol::{CompositionArgs, LoaderRequest, ReplyListener};
use tracing_subscriber::EnvFilter;

use modules::{ModuleHost, main_jobs};

fn main() -> Result<()> {
    init_tracing();
    let args = CompositionArgs::from_env().context("parse loader arguments")?;
    let endpoint = args
        .loader
        .clone()
        .ok_or_else(|| anyhow!("missing --cascade-loader endpoint"))?;
    let listener = ReplyListener::bind(&endpoint).context("bind loader endpoint")?;
    tracing::info!(%endpoint, "loader listening");

    if let Some(fd) = args.runner_pipe {
        watch_runner(fd, args.continue_if_runner_dies)?;
    }

    let continue_if_runner_dies = args.continue_if_runner_dies;
    thread::Builder::new()
        .name("cascade-loader-control".to_string())
        .spawn(move || {
            let mut host = ModuleHost::new(args);
            if let Err(err) = serve(&listener, &mut host) {
                tracing::warn!(error = %format!("{err:#}"), "loader control failed");
            }
            if !continue_if_runner_dies {
                drop(host);
                std::process::exit(0);
            }
        })
        .context("spawn loader control thread")?;

    // Modules post work that must run on the process's main thread.
    for job in main_jobs().iter() {
        job.run();
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Handles replace requests until the runner disconnects.
fn serve(listener: &ReplyListener, host: &mut ModuleHost) -> Result<()> {
    let mut channel = listener.accept().context("accept runner")?;
    while let Some(message) = channel.recv(None).context("receive loader request")? {
        let success = match LoaderRequest::from_message(&message) {
            Ok(request) => match host.replace(&request) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(module = %request.module_path, error = %format!("{err:#}"), "replace failed");
                    false
                },
            },
            Err(err) => {
                tracing::warn!(error = %err, "malformed loader request");
                false
            },
        };
        channel
            .send(&replaced_reply(success))
            .context("send loader reply")?;
    }
    tracing::info!("runner closed the loader channel");
    Ok(())
}

/// Exits once the runner's end of the runner pipe closes, unless asked to
/// outlive the runner.
fn watch_runner(fd: i32, continue_if_runner_dies: bool) -> Result<()> {
    // SAFETY: the runner passed us this descriptor and nothing else owns it.
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    thread::Builder::new()
        .name("cascade-runner-watch".to_string())
        .spawn(move || {
            let mut buf = [0u8; 16];
            while matches!(pipe.read(&mut buf), Ok(n) if n > 0) {}
            if continue_if_runner_dies {
                tracing::info!("runner went away; continuing");
                return;
            }
            tracing::info!("runner went away; exiting");
            std::process::exit(0);
        })
        .context("spawn runner watch thread")?;
    Ok(())
}
