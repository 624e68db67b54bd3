//! Channel framing: fixed text prefix + frame text (see protocol module).

use crate::protocol::{Frame, ParseError};

/// Marks protocol traffic on a channel shared with unrelated messages.
pub const MESSAGE_PREFIX: &str = "MYAPP_FILE_TRANSFER:";

/// Encode a frame into one channel message: prefix + frame text.
pub fn encode_message(frame: &Frame) -> String {
    format!("{MESSAGE_PREFIX}{frame}")
}

/// Decode one channel message. Text without the prefix is [`MessageDecodeError::NotProtocol`].
pub fn decode_message(text: &str) -> Result<Frame, MessageDecodeError> {
    let body = text
        .strip_prefix(MESSAGE_PREFIX)
        .ok_or(MessageDecodeError::NotProtocol)?;
    Ok(body.parse::<Frame>()?)
}

/// Error decoding a channel message (foreign traffic, or a bad frame).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("not a protocol message")]
    NotProtocol,
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

impl MessageDecodeError {
    /// True for errors a receiver should skip without logging a warning.
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            MessageDecodeError::NotProtocol
                | MessageDecodeError::Parse(ParseError::UnknownKeyword(_))
        )
    }
}
