mod cli;

use anyhow::{Context, Result};
use cascade_runner::{LaunchMode, PortUpdate, Runner, RunnerDelegate, RunnerOptions};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let options = match &cli.options {
        Some(path) => RunnerOptions::from_json_file(path)
            .with_context(|| format!("load options {}", path.display()))?,
        None => RunnerOptions::default(),
    };
    let mode = match (&cli.loader, cli.in_process) {
        (Some(loader), _) => LaunchMode::Loader {
            loader: loader.clone(),
            module: cli.composition.clone(),
        },
        (None, true) => LaunchMode::Module {
            module: cli.composition.clone(),
        },
        (None, false) => LaunchMode::Executable {
            executable: cli.composition.clone(),
        },
    };
    let mut builder = Runner::builder(mode).options(options);
    if let Some(dir) = &cli.source_dir {
        builder = builder.source_dir(dir);
    }
    let runner = builder.build().context("set up runner")?;
    runner.set_delegate(Some(Box::new(LogDelegate)));

    // Blocking runner calls keep the main queue of an in-process
    // composition drained from this thread.
    runner.start_paused().context("start composition")?;
    let outcome = drive(&cli, &runner);
    runner.stop();
    outcome
}

fn drive(cli: &Cli, runner: &Runner) -> Result<()> {
    if cli.list_ports {
        for port in runner.published_input_ports()? {
            println!("input  {} : {}", port.name(), port.type_name());
        }
        for port in runner.published_output_ports()? {
            println!("output {} : {}", port.name(), port.type_name());
        }
        return Ok(());
    }

    runner.set_published_input_port_values(cli.sets.iter().cloned())?;
    runner.unpause()?;

    if cli.fire_all {
        runner.fire_all_published_input_port_events()?;
    } else if cli.fires.is_empty() {
        tracing::info!("composition running; waiting for it to stop");
        runner.wait_until_stopped();
        return Ok(());
    } else {
        runner.fire_published_input_port_events(cli.fires.iter().cloned())?;
    }
    runner.wait_for_fired_published_input_port_event();
    for port in runner.published_output_ports()? {
        let value = runner.published_output_port_value(port.name())?;
        match value {
            Some(value) => println!("{} = {value}", port.name()),
            None => println!("{} has no value", port.name()),
        }
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

struct LogDelegate;

impl RunnerDelegate for LogDelegate {
    fn published_output_port_updated(&mut self, port: &str, sent_data: bool, summary: &str) {
        tracing::info!(port, sent_data, summary, "published output updated");
    }

    fn output_port_updated(&mut self, update: &PortUpdate) {
        tracing::debug!(
            composition = %update.composition,
            port = %update.port,
            summary = %update.summary,
            "output port updated"
        );
    }

    fn event_dropped(&mut self, composition: &str, port: &str) {
        tracing::warn!(composition, port, "event dropped");
    }

    fn composition_error(&mut self, message: &str) {
        tracing::error!(error = message, "composition error");
    }

    fn lost_contact(&mut self) {
        tracing::error!("lost contact with the composition");
    }
}
