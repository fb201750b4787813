use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for one runner session.
///
/// Durations are stored in milliseconds so the struct reads naturally from
/// a JSON file; the `*_timeout()` accessors convert them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerOptions {
    /// Keep the composition running if the runner process dies.
    pub continue_if_runner_dies: bool,
    /// Delete the composition module or executable when the session ends.
    pub delete_binaries_when_finished: bool,
    pub connect_retry_ms: u64,
    /// Telemetry silence after which contact is considered lost.
    pub heartbeat_timeout_ms: u64,
    /// How long `start` waits for the first telemetry message.
    pub startup_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Stop handshake limit for out-of-process compositions.
    pub stop_timeout_ms: u64,
    /// Time the process tree gets to exit before it is killed.
    pub process_exit_grace_ms: u64,
    /// Ignore telemetry silence caused by the host sleeping.
    pub tolerate_host_sleep: bool,
    /// Ignore telemetry silence while a debugger is attached to the runner.
    pub tolerate_debugger: bool,
    /// Substrings marking composition error messages that are delivered to
    /// the delegate but not logged above debug level.
    pub quiet_error_patterns: Vec<String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            continue_if_runner_dies: false,
            delete_binaries_when_finished: false,
            connect_retry_ms: 1000,
            heartbeat_timeout_ms: 1000,
            startup_timeout_ms: 10_000,
            discovery_timeout_ms: 5000,
            stop_timeout_ms: 5000,
            process_exit_grace_ms: 2000,
            tolerate_host_sleep: true,
            tolerate_debugger: true,
            quiet_error_patterns: Vec::new(),
        }
    }
}

impl RunnerOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        let options: Self = serde_json::from_str(&raw).map_err(|e| Error::json_at(path, e))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::invalid_input(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn process_exit_grace(&self) -> Duration {
        Duration::from_millis(self.process_exit_grace_ms)
    }

    pub fn is_quiet_error(&self, message: &str) -> bool {
        self.quiet_error_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && message.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::RunnerOptions;
    use crate::error::Error;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runner.json");
        std::fs::write(
            &path,
            r#"{ "stop_timeout_ms": 250, "quiet_error_patterns": ["libEGL"] }"#,
        )
        .expect("write config");

        let options = RunnerOptions::from_json_file(&path).expect("load");
        assert_eq!(options.stop_timeout_ms, 250);
        assert_eq!(options.heartbeat_timeout_ms, 1000);
        assert!(options.is_quiet_error("libEGL warning: no display"));
        assert!(!options.is_quiet_error("node crashed"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{ "heartbeat_timeout_ms": 0 }"#).expect("write config");
        let err = RunnerOptions::from_json_file(&path).expect_err("invalid");
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").expect("write config");
        match RunnerOptions::from_json_file(&path).expect_err("malformed") {
            Error::JsonAt { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
