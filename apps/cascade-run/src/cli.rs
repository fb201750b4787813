use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde_json::Value;

#[derive(Debug, Parser, Clone)]
#[command(name = "cascade-run")]
#[command(about = "Run a compiled composition and drive its published ports")]
pub struct Cli {
    /// Composition executable, or a composition module with `--loader` or
    /// `--in-process`.
    pub composition: PathBuf,

    /// Run the module through this loader executable so it can be replaced
    /// while it runs.
    #[arg(long, conflicts_with = "in_process")]
    pub loader: Option<PathBuf>,

    /// Load the module into this process.
    #[arg(long)]
    pub in_process: bool,

    /// Directory the composition reads its relative resources from.
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Runner options as a JSON file.
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Set a published input before the composition runs, as `name=json`.
    #[arg(long = "set", value_name = "NAME=JSON", value_parser = parse_assignment)]
    pub sets: Vec<(String, Value)>,

    /// Fire an event through these published inputs, then print the
    /// published outputs and stop.
    #[arg(long = "fire", value_name = "PORT")]
    pub fires: Vec<String>,

    /// Fire one event through every published input instead.
    #[arg(long, conflicts_with = "fires")]
    pub fire_all: bool,

    /// Print the published ports and exit.
    #[arg(long)]
    pub list_ports: bool,
}

fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=json, got `{raw}`"))?;
    let value = serde_json::from_str(value)
        .or_else(|_| serde_json::to_value(value))
        .with_context(|| format!("value for `{name}`"))?;
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use clap::Parser;

    use super::{Cli, parse_assignment};

    #[test]
    fn fire_all_excludes_named_fires() {
        let cli = Cli::try_parse_from(["cascade-run", "comp", "--fire-all"]).expect("parse");
        assert!(cli.fire_all);
        assert!(Cli::try_parse_from(["cascade-run", "comp", "--fire-all", "--fire", "a"]).is_err());
    }

    #[test]
    fn assignments_take_json_or_bare_strings() {
        assert_eq!(
            parse_assignment("count=3").expect("json"),
            ("count".to_string(), json!(3))
        );
        assert_eq!(
            parse_assignment("label=hello world").expect("string"),
            ("label".to_string(), json!("hello world"))
        );
        assert_eq!(
            parse_assignment("list=[1,2]=x").expect("split once"),
            ("list".to_string(), json!("[1,2]=x"))
        );
        assert!(parse_assignment("no-equals").is_err());
    }
}
