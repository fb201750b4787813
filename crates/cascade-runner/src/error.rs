use std::path::PathBuf;

use cascade_protocol::ProtoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The composition could not be launched. Never retried.
    #[error("start failed during {stage}: {details}")]
    StartFailure { stage: &'static str, details: String },
    /// Wrong reply tag or undecodable frames.
    #[error("protocol fault during {operation}: {details}")]
    ProtocolFault {
        operation: &'static str,
        details: String,
    },
    #[error("transport failed during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: ProtoError,
    },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("composition replacement failed: {details}")]
    ReplaceFailed { details: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("not found: {resource} `{id}`")]
    NotFound { resource: &'static str, id: String },
    #[error("conflict: {resource} `{id}`")]
    Conflict { resource: &'static str, id: String },
    #[error("unsupported: {message}")]
    Unsupported { message: String },
    #[error("{operation} failed: {details}")]
    Operation {
        operation: &'static str,
        details: String,
    },
    #[error("io failed at `{path}`: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json failed at `{path}`: {source}")]
    JsonAt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn start_failure(stage: &'static str, details: impl Into<String>) -> Self {
        Self::StartFailure {
            stage,
            details: details.into(),
        }
    }

    pub fn protocol_fault(operation: &'static str, details: impl Into<String>) -> Self {
        Self::ProtocolFault {
            operation,
            details: details.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(resource: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            resource,
            id: id.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn operation(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            details: details.into(),
        }
    }

    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn json_at(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::JsonAt {
            path: path.into(),
            source,
        }
    }

    /// Classifies a channel failure: timeouts stay timeouts, undecodable
    /// traffic is a protocol fault, the rest is transport.
    pub fn from_proto(operation: &'static str, source: ProtoError) -> Self {
        match source {
            ProtoError::Timeout { timeout_ms, .. } => Self::Timeout {
                operation,
                timeout_ms,
            },
            ProtoError::Malformed { .. } | ProtoError::UnknownTag { .. } | ProtoError::Postcard(_) => {
                Self::protocol_fault(operation, source.to_string())
            },
            source => Self::Transport { operation, source },
        }
    }

    /// Any failure while the session is starting is fatal to it and is
    /// reported as a start failure of `stage`.
    pub fn into_start_failure(self, stage: &'static str) -> Self {
        match self {
            Self::StartFailure { .. } => self,
            other => Self::start_failure(stage, other.to_string()),
        }
    }

    /// Errors after which the channel to the composition can no longer be
    /// trusted.
    pub fn breaks_contact(&self) -> bool {
        matches!(
            self,
            Self::ProtocolFault { .. }
                | Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::ReplaceFailed { .. }
        )
    }
}

pub trait ErrorContext<T, E> {
    fn start_context(self, stage: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T, E> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn start_context(self, stage: &'static str) -> Result<T> {
        self.map_err(|error| Error::start_failure(stage, error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use cascade_protocol::ProtoError;

    use super::{Error, ErrorContext};

    #[test]
    fn proto_errors_are_classified() {
        let timeout = Error::from_proto(
            "discover",
            ProtoError::Timeout {
                waiting_for: "reply",
                timeout_ms: 5000,
            },
        );
        assert!(matches!(timeout, Error::Timeout { timeout_ms: 5000, .. }));

        let fault = Error::from_proto("pause", ProtoError::malformed(3, "short"));
        assert!(matches!(fault, Error::ProtocolFault { operation: "pause", .. }));

        let transport = Error::from_proto("pause", ProtoError::Closed);
        assert!(matches!(transport, Error::Transport { .. }));
        assert!(transport.breaks_contact());
    }

    #[test]
    fn start_context_tags_the_stage() {
        let result: std::result::Result<(), &str> = Err("no such file");
        let err = result.start_context("fork").expect_err("error");
        assert_eq!(err.to_string(), "start failed during fork: no such file");
        assert!(!err.breaks_contact());
    }

    #[test]
    fn handshake_failures_become_start_failures() {
        let closed = Error::from_proto("slow heartbeat", ProtoError::Closed);
        let err = closed.into_start_failure("handshake");
        assert!(matches!(err, Error::StartFailure { stage: "handshake", .. }));
        assert!(err.to_string().contains("slow heartbeat"));
        assert!(!err.breaks_contact());

        let exec = Error::start_failure("exec", "no such file");
        assert!(matches!(
            exec.into_start_failure("handshake"),
            Error::StartFailure { stage: "exec", .. }
        ));
    }
}
