//! Mesh Courier frame grammar: frame types plus their text form.
//!
//! ```text
//! FILE_START:<filename>:<totalChunks>:<compressionTag>
//! CHUNK:<index>:<payload>
//! ACK:<index>
//! FILE_END
//! ```

use std::fmt;
use std::str::FromStr;

use crate::codec::CompressionKind;

/// Field delimiter. Only the `CHUNK` payload may contain it.
pub const DELIMITER: char = ':';

const FILE_START: &str = "FILE_START";
const CHUNK: &str = "CHUNK";
const ACK: &str = "ACK";
const FILE_END: &str = "FILE_END";

/// One protocol message exchanged over the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Announces a transfer. Sent once, not acknowledged.
    FileStart {
        filename: String,
        total_chunks: u32,
        compression: CompressionKind,
    },
    /// One slice of the transport text.
    Chunk { index: u32, payload: String },
    /// Receiver confirms it holds chunk `index`.
    Ack { index: u32 },
    /// Sender has no more chunks.
    FileEnd,
}

impl Frame {
    pub fn keyword(&self) -> &'static str {
        match self {
            Frame::FileStart { .. } => FILE_START,
            Frame::Chunk { .. } => CHUNK,
            Frame::Ack { .. } => ACK,
            Frame::FileEnd => FILE_END,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::FileStart {
                filename,
                total_chunks,
                compression,
            } => write!(f, "{FILE_START}:{filename}:{total_chunks}:{compression}"),
            Frame::Chunk { index, payload } => write!(f, "{CHUNK}:{index}:{payload}"),
            Frame::Ack { index } => write!(f, "{ACK}:{index}"),
            Frame::FileEnd => f.write_str(FILE_END),
        }
    }
}

impl FromStr for Frame {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let keyword = s.split(DELIMITER).next().unwrap_or_default();
        match keyword {
            FILE_START => {
                let fields: Vec<&str> = s.split(DELIMITER).collect();
                let &[_, filename, total, tag] = fields.as_slice() else {
                    return Err(ParseError::Malformed);
                };
                if filename.is_empty() {
                    return Err(ParseError::Malformed);
                }
                let total_chunks = parse_number("totalChunks", total)?;
                let compression = tag
                    .parse::<CompressionKind>()
                    .map_err(|e| ParseError::UnknownCompression(e.0))?;
                Ok(Frame::FileStart {
                    filename: filename.to_string(),
                    total_chunks,
                    compression,
                })
            }
            CHUNK => {
                let mut parts = s.splitn(3, DELIMITER).skip(1);
                let (Some(index), Some(payload)) = (parts.next(), parts.next()) else {
                    return Err(ParseError::Malformed);
                };
                Ok(Frame::Chunk {
                    index: parse_number("index", index)?,
                    payload: payload.to_string(),
                })
            }
            ACK => {
                let fields: Vec<&str> = s.split(DELIMITER).collect();
                let &[_, index] = fields.as_slice() else {
                    return Err(ParseError::Malformed);
                };
                Ok(Frame::Ack {
                    index: parse_number("index", index)?,
                })
            }
            FILE_END if s == FILE_END => Ok(Frame::FileEnd),
            FILE_END => Err(ParseError::Malformed),
            other => Err(ParseError::UnknownKeyword(other.to_string())),
        }
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<u32, ParseError> {
    raw.parse::<u32>().map_err(|_| ParseError::NotANumber {
        field,
        value: raw.to_string(),
    })
}

/// A frame's text did not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed frame")]
    Malformed,
    #[error("unknown compression tag: {0:?}")]
    UnknownCompression(String),
    #[error("{field} is not a number: {value:?}")]
    NotANumber { field: &'static str, value: String },
    /// Not ours to handle; receivers skip these silently.
    #[error("unknown frame keyword: {0:?}")]
    UnknownKeyword(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let text = frame.to_string();
        let parsed: Frame = text.parse().unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn roundtrip_all_variants() {
        roundtrip(Frame::FileStart {
            filename: "test.txt".into(),
            total_chunks: 12,
            compression: CompressionKind::Lzma,
        });
        roundtrip(Frame::Chunk {
            index: 3,
            payload: "YWJj".into(),
        });
        roundtrip(Frame::Chunk {
            index: 0,
            payload: String::new(),
        });
        roundtrip(Frame::Ack { index: 41 });
        roundtrip(Frame::FileEnd);
    }

    #[test]
    fn wire_text() {
        let start = Frame::FileStart {
            filename: "test.txt".into(),
            total_chunks: 1,
            compression: CompressionKind::None,
        };
        assert_eq!(start.to_string(), "FILE_START:test.txt:1:none");
        assert_eq!(
            Frame::Chunk {
                index: 0,
                payload: "YWJj".into()
            }
            .to_string(),
            "CHUNK:0:YWJj"
        );
        assert_eq!(Frame::Ack { index: 0 }.to_string(), "ACK:0");
        assert_eq!(Frame::FileEnd.to_string(), "FILE_END");
    }

    #[test]
    fn chunk_payload_keeps_delimiters() {
        let frame: Frame = "CHUNK:5:a:b::c".parse().unwrap();
        assert_eq!(
            frame,
            Frame::Chunk {
                index: 5,
                payload: "a:b::c".into()
            }
        );
    }

    #[test]
    fn malformed_frames() {
        for text in [
            "FILE_START:test.txt:1",
            "FILE_START:a:b.txt:1:none",
            "FILE_START::1:none",
            "CHUNK:4",
            "CHUNK",
            "ACK",
            "ACK:1:2",
            "FILE_END:extra",
        ] {
            assert_eq!(text.parse::<Frame>(), Err(ParseError::Malformed), "{text}");
        }
    }

    #[test]
    fn non_numeric_fields() {
        assert!(matches!(
            "CHUNK:x:abc".parse::<Frame>(),
            Err(ParseError::NotANumber { field: "index", .. })
        ));
        assert!(matches!(
            "ACK:-1".parse::<Frame>(),
            Err(ParseError::NotANumber { .. })
        ));
        assert!(matches!(
            "FILE_START:a.txt:many:none".parse::<Frame>(),
            Err(ParseError::NotANumber {
                field: "totalChunks",
                ..
            })
        ));
    }

    #[test]
    fn unknown_compression() {
        assert_eq!(
            "FILE_START:a.txt:2:brotli".parse::<Frame>(),
            Err(ParseError::UnknownCompression("brotli".into()))
        );
    }

    #[test]
    fn unknown_keyword() {
        assert_eq!(
            "PING:1".parse::<Frame>(),
            Err(ParseError::UnknownKeyword("PING".into()))
        );
    }
}
