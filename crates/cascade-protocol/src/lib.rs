//! Wire protocol shared by the runner, the loader and compositions.
//!
//! Every channel carries [`Message`] values: a numeric tag followed by an
//! ordered list of [`Frame`]s. Messages travel as a little-endian `u32`
//! length prefix followed by a postcard payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod abi;
pub mod args;
pub mod control;
pub mod loader;
pub mod message;
pub mod telemetry;
pub mod transport;

pub use args::CompositionArgs;
pub use control::{ControlReplyTag, ControlRequest, ControlRequestTag};
pub use loader::{LoaderReplyTag, LoaderRequest, LoaderRequestTag};
pub use message::{Frame, FrameReader, Message};
pub use telemetry::{PortUpdate, PublishedPortUpdate, Telemetry, TelemetryTag};
pub use transport::{Endpoint, Publisher, ReplyChannel, ReplyListener, RequestChannel, Subscriber};

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("timed out after {timeout_ms}ms waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        timeout_ms: u64,
    },

    #[error("channel closed by peer")]
    Closed,

    #[error("channel is unusable after an earlier failure")]
    Poisoned,

    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u32 },

    #[error("malformed message (tag {tag}): {details}")]
    Malformed { tag: u32, details: String },

    #[error("invalid endpoint `{endpoint}`: {details}")]
    InvalidEndpoint { endpoint: String, details: String },

    #[error("invalid argument `{argument}`: {details}")]
    InvalidArgument { argument: String, details: String },
}

impl ProtoError {
    pub fn malformed(tag: u32, details: impl Into<String>) -> Self {
        Self::Malformed {
            tag,
            details: details.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub fn write_frame<W: std::io::Write, T: Serialize>(mut w: W, msg: &T) -> Result<(), ProtoError> {
    let payload = postcard::to_stdvec(msg)?;
    write_encoded(&mut w, &payload)
}

pub fn read_frame<R: std::io::Read, T: for<'de> Deserialize<'de>>(
    mut r: R,
) -> Result<T, ProtoError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}

/// Writes an already encoded payload; the publisher encodes once per fan-out.
pub(crate) fn write_encoded<W: std::io::Write>(w: &mut W, payload: &[u8]) -> Result<(), ProtoError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Declares a wire tag enum with explicit discriminants and a checked
/// conversion from the raw `u32` carried in [`Message::tag`].
macro_rules! wire_tags {
    ($(#[$meta:meta])* $vis:vis enum $name:ident ($kind:literal) { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        $vis enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_u32(tag: u32) -> Option<Self> {
                match tag {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for u32 {
            fn from(tag: $name) -> u32 {
                tag as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = $crate::ProtoError;

            fn try_from(tag: u32) -> Result<Self, $crate::ProtoError> {
                Self::from_u32(tag).ok_or($crate::ProtoError::UnknownTag { kind: $kind, tag })
            }
        }
    };
}

pub(crate) use wire_tags;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{MAX_FRAME_BYTES, Message, ProtoError, read_frame, write_frame};

    #[test]
    fn frame_prefix_is_little_endian_payload_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Message::new(7u32).with("x")).expect("write frame");
        let len = u32::from_le_bytes(buf[..4].try_into().expect("prefix")) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[test]
    fn oversized_prefix_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_le_bytes());
        let err = read_frame::<_, Message>(Cursor::new(buf)).expect_err("must reject");
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn truncated_payload_is_an_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Message::new(3u32).with("hello")).expect("write frame");
        buf.truncate(buf.len() - 2);
        let err = read_frame::<_, Message>(Cursor::new(buf)).expect_err("must fail");
        assert!(matches!(err, ProtoError::Io(_)));
    }
}
