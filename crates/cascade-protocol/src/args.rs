//! Command-line contract between the runner and a spawned composition or
//! loader process.

use std::os::fd::RawFd;

use crate::ProtoError;
use crate::transport::Endpoint;

pub const CONTROL_ARG: &str = "--cascade-control";
pub const TELEMETRY_ARG: &str = "--cascade-telemetry";
pub const LOADER_ARG: &str = "--cascade-loader";
pub const RUNNER_PID_ARG: &str = "--cascade-runner-pid";
pub const RUNNER_PIPE_ARG: &str = "--cascade-runner-pipe";
pub const LIVENESS_PIPE_ARG: &str = "--cascade-liveness-pipe";
pub const PAUSE_ARG: &str = "--cascade-pause";
pub const CONTINUE_IF_RUNNER_DIES_ARG: &str = "--cascade-continue-if-runner-dies";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionArgs {
    pub control: Endpoint,
    pub telemetry: Endpoint,
    /// Present only when the process is the generic loader.
    pub loader: Option<Endpoint>,
    pub runner_pid: Option<u32>,
    /// Read end of a pipe whose write end only the runner holds; EOF means
    /// the runner is gone.
    pub runner_pipe: Option<RawFd>,
    /// Write end of the pipe the runner watches to detect this process
    /// tree exiting. The process only has to keep it open.
    pub liveness_pipe: Option<RawFd>,
    pub start_paused: bool,
    pub continue_if_runner_dies: bool,
}

impl CompositionArgs {
    pub fn new(control: Endpoint, telemetry: Endpoint) -> Self {
        Self {
            control,
            telemetry,
            loader: None,
            runner_pid: None,
            runner_pipe: None,
            liveness_pipe: None,
            start_paused: false,
            continue_if_runner_dies: false,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("{CONTROL_ARG}={}", self.control),
            format!("{TELEMETRY_ARG}={}", self.telemetry),
        ];
        if let Some(loader) = &self.loader {
            args.push(format!("{LOADER_ARG}={loader}"));
        }
        if let Some(pid) = self.runner_pid {
            args.push(format!("{RUNNER_PID_ARG}={pid}"));
        }
        if let Some(fd) = self.runner_pipe {
            args.push(format!("{RUNNER_PIPE_ARG}={fd}"));
        }
        if let Some(fd) = self.liveness_pipe {
            args.push(format!("{LIVENESS_PIPE_ARG}={fd}"));
        }
        if self.start_paused {
            args.push(PAUSE_ARG.to_string());
        }
        if self.continue_if_runner_dies {
            args.push(CONTINUE_IF_RUNNER_DIES_ARG.to_string());
        }
        args
    }

    /// Parses the runner's arguments out of a full argument list. Arguments
    /// the runner does not own (including `argv[0]`) are ignored, so a
    /// composition may accept its own flags alongside these.
    pub fn parse<I, S>(args: I) -> Result<Self, ProtoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut control = None;
        let mut telemetry = None;
        let mut parsed = Self::new(Endpoint::Tcp(String::new()), Endpoint::Tcp(String::new()));

        for arg in args {
            let arg = arg.as_ref();
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };
            match (name, value) {
                (CONTROL_ARG, Some(value)) => control = Some(Endpoint::parse(value)?),
                (TELEMETRY_ARG, Some(value)) => telemetry = Some(Endpoint::parse(value)?),
                (LOADER_ARG, Some(value)) => parsed.loader = Some(Endpoint::parse(value)?),
                (RUNNER_PID_ARG, Some(value)) => parsed.runner_pid = Some(parse_number(arg, value)?),
                (RUNNER_PIPE_ARG, Some(value)) => parsed.runner_pipe = Some(parse_number(arg, value)?),
                (LIVENESS_PIPE_ARG, Some(value)) => {
                    parsed.liveness_pipe = Some(parse_number(arg, value)?)
                },
                (PAUSE_ARG, None) => parsed.start_paused = true,
                (CONTINUE_IF_RUNNER_DIES_ARG, None) => parsed.continue_if_runner_dies = true,
                (
                    CONTROL_ARG | TELEMETRY_ARG | LOADER_ARG | RUNNER_PID_ARG | RUNNER_PIPE_ARG
                    | LIVENESS_PIPE_ARG,
                    None,
                ) => {
                    return Err(ProtoError::InvalidArgument {
                        argument: arg.to_string(),
                        details: "missing `=value`".to_string(),
                    });
                },
                _ => {},
            }
        }

        parsed.control = control.ok_or_else(|| missing(CONTROL_ARG))?;
        parsed.telemetry = telemetry.ok_or_else(|| missing(TELEMETRY_ARG))?;
        Ok(parsed)
    }

    pub fn from_env() -> Result<Self, ProtoError> {
        Self::parse(std::env::args())
    }
}

fn parse_number<T: std::str::FromStr>(arg: &str, value: &str) -> Result<T, ProtoError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ProtoError::InvalidArgument {
        argument: arg.to_string(),
        details: err.to_string(),
    })
}

fn missing(name: &str) -> ProtoError {
    ProtoError::InvalidArgument {
        argument: name.to_string(),
        details: "required".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::CompositionArgs;
    use crate::ProtoError;
    use crate::transport::Endpoint;

    #[test]
    fn formatted_arguments_parse_back_alongside_foreign_flags() {
        let mut args = CompositionArgs::new(
            Endpoint::ipc("/tmp/s/control"),
            Endpoint::ipc("/tmp/s/telemetry"),
        );
        args.loader = Some(Endpoint::ipc("/tmp/s/loader"));
        args.runner_pid = Some(42);
        args.runner_pipe = Some(5);
        args.liveness_pipe = Some(6);
        args.start_paused = true;

        let mut argv = vec!["composition".to_string(), "--verbose".to_string()];
        argv.extend(args.to_args());
        assert_eq!(CompositionArgs::parse(argv).expect("parse"), args);
    }

    #[test]
    fn control_and_telemetry_are_required() {
        let err = CompositionArgs::parse(["bin", "--cascade-telemetry=ipc:///t"])
            .expect_err("control missing");
        assert!(matches!(err, ProtoError::InvalidArgument { ref argument, .. } if argument == "--cascade-control"));
    }

    #[test]
    fn bad_pipe_descriptor_is_rejected() {
        let err = CompositionArgs::parse([
            "--cascade-control=ipc:///c",
            "--cascade-telemetry=ipc:///t",
            "--cascade-runner-pipe=abc",
        ])
        .expect_err("not a number");
        assert!(matches!(err, ProtoError::InvalidArgument { .. }));
    }
}
