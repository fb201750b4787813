use serde::{Deserialize, Serialize};

use crate::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl From<bool> for Frame {
    fn from(value: bool) -> Self {
        Frame::Bool(value)
    }
}

impl From<i64> for Frame {
    fn from(value: i64) -> Self {
        Frame::Int(value)
    }
}

impl From<u64> for Frame {
    fn from(value: u64) -> Self {
        Frame::UInt(value)
    }
}

impl From<&str> for Frame {
    fn from(value: &str) -> Self {
        Frame::Str(value.to_string())
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Frame::Str(value)
    }
}

impl From<Option<String>> for Frame {
    fn from(value: Option<String>) -> Self {
        value.map(Frame::Str).unwrap_or(Frame::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub tag: u32,
    pub frames: Vec<Frame>,
}

impl Message {
    pub fn new(tag: impl Into<u32>) -> Self {
        Self {
            tag: tag.into(),
            frames: Vec::new(),
        }
    }

    pub fn with(mut self, frame: impl Into<Frame>) -> Self {
        self.frames.push(frame.into());
        self
    }

    pub fn push(&mut self, frame: impl Into<Frame>) {
        self.frames.push(frame.into());
    }

    /// Appends a count frame followed by one string frame per item.
    pub fn push_list<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: ExactSizeIterator,
        S: Into<String>,
    {
        let items = items.into_iter();
        self.frames.push(Frame::UInt(items.len() as u64));
        self.frames.extend(items.map(|item| Frame::Str(item.into())));
    }

    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader {
            tag: self.tag,
            frames: &self.frames,
            position: 0,
        }
    }
}

/// Sequential typed access to a message's frames.
///
/// Every accessor fails with [`ProtoError::Malformed`] when the next frame
/// is missing or has a different type.
pub struct FrameReader<'a> {
    tag: u32,
    frames: &'a [Frame],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn has_more(&self) -> bool {
        self.position < self.frames.len()
    }

    pub fn remaining(&self) -> usize {
        self.frames.len() - self.position
    }

    fn next_frame(&mut self, expected: &str) -> Result<&'a Frame, ProtoError> {
        let frame = self.frames.get(self.position).ok_or_else(|| {
            ProtoError::malformed(
                self.tag,
                format!("missing {expected} at frame {}", self.position),
            )
        })?;
        self.position += 1;
        Ok(frame)
    }

    fn mismatch(&self, expected: &str, found: &Frame) -> ProtoError {
        ProtoError::malformed(
            self.tag,
            format!(
                "expected {expected} at frame {}, found {found:?}",
                self.position - 1
            ),
        )
    }

    pub fn string(&mut self) -> Result<&'a str, ProtoError> {
        match self.next_frame("string")? {
            Frame::Str(value) => Ok(value),
            other => Err(self.mismatch("string", other)),
        }
    }

    /// A string frame that may be sent as `Null`.
    pub fn optional_string(&mut self) -> Result<Option<&'a str>, ProtoError> {
        match self.next_frame("string")? {
            Frame::Str(value) => Ok(Some(value)),
            Frame::Null => Ok(None),
            other => Err(self.mismatch("string", other)),
        }
    }

    pub fn boolean(&mut self) -> Result<bool, ProtoError> {
        match self.next_frame("bool")? {
            Frame::Bool(value) => Ok(*value),
            other => Err(self.mismatch("bool", other)),
        }
    }

    pub fn int(&mut self) -> Result<i64, ProtoError> {
        match self.next_frame("int")? {
            Frame::Int(value) => Ok(*value),
            other => Err(self.mismatch("int", other)),
        }
    }

    pub fn uint(&mut self) -> Result<u64, ProtoError> {
        match self.next_frame("uint")? {
            Frame::UInt(value) => Ok(*value),
            other => Err(self.mismatch("uint", other)),
        }
    }

    /// Reads a list written by [`Message::push_list`].
    pub fn string_list(&mut self) -> Result<Vec<String>, ProtoError> {
        let count = self.uint()? as usize;
        if count > self.remaining() {
            return Err(ProtoError::malformed(
                self.tag,
                format!("list claims {count} items, {} frames left", self.remaining()),
            ));
        }
        (0..count).map(|_| self.string().map(str::to_string)).collect()
    }

    /// Reads every remaining frame as a string.
    pub fn rest_as_strings(&mut self) -> Result<Vec<String>, ProtoError> {
        let mut out = Vec::with_capacity(self.remaining());
        while self.has_more() {
            out.push(self.string()?.to_string());
        }
        Ok(out)
    }

    pub fn finish(&self) -> Result<(), ProtoError> {
        if self.has_more() {
            return Err(ProtoError::malformed(
                self.tag,
                format!("{} unexpected trailing frames", self.remaining()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, Message};
    use crate::ProtoError;

    #[test]
    fn reader_rejects_type_mismatch_with_position() {
        let message = Message::new(4u32).with("port").with(true);
        let mut reader = message.reader();
        assert_eq!(reader.string().expect("string"), "port");
        let err = reader.string().expect_err("bool is not a string");
        match err {
            ProtoError::Malformed { tag, details } => {
                assert_eq!(tag, 4);
                assert!(details.contains("frame 1"), "{details}");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn string_list_checks_declared_count() {
        let message = Message {
            tag: 9,
            frames: vec![Frame::UInt(3), Frame::Str("a".into())],
        };
        assert!(message.reader().string_list().is_err());
    }

    #[test]
    fn finish_reports_trailing_frames() {
        let message = Message::new(1u32).with("a").with("b");
        let mut reader = message.reader();
        reader.string().expect("first");
        assert!(reader.finish().is_err());
        reader.string().expect("second");
        reader.finish().expect("exhausted");
    }

    #[test]
    fn null_frame_reads_as_absent_optional_string() {
        let message = Message::new(2u32).with(None::<String>);
        assert_eq!(message.reader().optional_string().expect("optional"), None);
    }
}
