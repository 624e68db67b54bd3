//! Codec: compression, transport-text (base64) encoding, and chunk splitting.
//! Pure functions; no state and no I/O beyond in-memory buffers.

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

/// Default chunk size in transport-text characters.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Upper bound accepted for a configured chunk size.
pub const MAX_CHUNK_SIZE: usize = 220;

/// Entry name used inside single-file ZIP archives.
const ZIP_ENTRY_NAME: &str = "file";

const XZ_PRESET: u32 = 6;

/// Compression applied to the file before transport-text encoding. Declared by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionKind {
    #[default]
    None,
    Zip,
    Gzip,
    Lzma,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 4] = [
        CompressionKind::None,
        CompressionKind::Zip,
        CompressionKind::Gzip,
        CompressionKind::Lzma,
    ];

    /// Tag carried in `FILE_START` frames.
    pub fn tag(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Zip => "zip",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Lzma => "lzma",
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CompressionKind {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompressionKind::ALL
            .into_iter()
            .find(|k| k.tag() == s)
            .ok_or_else(|| UnknownCompression(s.to_string()))
    }
}

/// Tag did not name a known compression kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown compression tag: {0:?}")]
pub struct UnknownCompression(pub String);

/// Compress `data` with `kind`. `None` is the identity.
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, EncodeError> {
    let fail = |e: &dyn fmt::Display| EncodeError::Compress {
        kind,
        message: e.to_string(),
    };
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Zip => {
            let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            writer
                .start_file(ZIP_ENTRY_NAME, options)
                .map_err(|e| fail(&e))?;
            writer.write_all(data).map_err(|e| fail(&e))?;
            let cursor = writer.finish().map_err(|e| fail(&e))?;
            Ok(cursor.into_inner())
        }
        CompressionKind::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).map_err(|e| fail(&e))?;
            enc.finish().map_err(|e| fail(&e))
        }
        CompressionKind::Lzma => {
            let mut enc = XzEncoder::new(Vec::new(), XZ_PRESET);
            enc.write_all(data).map_err(|e| fail(&e))?;
            enc.finish().map_err(|e| fail(&e))
        }
    }
}

/// Inverse of [`compress`]. Fails on corrupt or truncated archives.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, DecodeError> {
    let fail = |e: &dyn fmt::Display| DecodeError::Decompress {
        kind,
        message: e.to_string(),
    };
    let mut out = Vec::new();
    match kind {
        CompressionKind::None => return Ok(data.to_vec()),
        CompressionKind::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(|e| fail(&e))?;
            let mut entry = archive.by_name(ZIP_ENTRY_NAME).map_err(|e| fail(&e))?;
            entry.read_to_end(&mut out).map_err(|e| fail(&e))?;
        }
        CompressionKind::Gzip => {
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| fail(&e))?;
        }
        CompressionKind::Lzma => {
            XzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| fail(&e))?;
        }
    }
    Ok(out)
}

/// Encode bytes as padded standard base64.
pub fn to_transport_text(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode padded standard base64. Rejects bad length, padding or alphabet.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(text)
        .map_err(DecodeError::InvalidTransportText)
}

/// Split `text` into slices of `chunk_size` characters; the last may be shorter.
/// A zero `chunk_size` falls back to [`DEFAULT_CHUNK_SIZE`]. Empty text yields no chunks.
pub fn split_into_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::with_capacity(text.len() / size + 1);
    let mut start = 0usize;
    let mut count = 0usize;
    for (pos, _) in text.char_indices() {
        if count == size {
            out.push(text[start..pos].to_string());
            start = pos;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        out.push(text[start..].to_string());
    }
    out
}

/// Concatenate chunks back into the transport text.
pub fn join<S: AsRef<str>>(chunks: &[S]) -> String {
    chunks.iter().map(AsRef::as_ref).collect()
}

/// Full sender pipeline: compress, encode, split.
pub fn encode_payload(
    data: &[u8],
    kind: CompressionKind,
    chunk_size: usize,
) -> Result<Vec<String>, EncodeError> {
    let compressed = compress(data, kind)?;
    Ok(split_into_chunks(&to_transport_text(&compressed), chunk_size))
}

/// Full receiver pipeline: join, decode, decompress. Chunks must already be in index order.
pub fn decode_payload<S: AsRef<str>>(
    chunks: &[S],
    kind: CompressionKind,
) -> Result<Vec<u8>, DecodeError> {
    let compressed = from_transport_text(&join(chunks))?;
    decompress(&compressed, kind)
}

/// Pre-flight size summary for a file under a given compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeReport {
    pub original: usize,
    pub compressed: usize,
    /// Length of the transport text.
    pub encoded: usize,
    pub chunks: usize,
}

pub fn estimate(
    data: &[u8],
    kind: CompressionKind,
    chunk_size: usize,
) -> Result<SizeReport, EncodeError> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let compressed = compress(data, kind)?;
    let encoded = to_transport_text(&compressed).len();
    Ok(SizeReport {
        original: data.len(),
        compressed: compressed.len(),
        encoded,
        chunks: encoded.div_ceil(size),
    })
}

/// Compression failed on the sending side.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{kind} compression failed: {message}")]
    Compress {
        kind: CompressionKind,
        message: String,
    },
}

/// Transport text or compressed payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid transport text: {0}")]
    InvalidTransportText(#[from] base64::DecodeError),
    #[error("{kind} decompression failed: {message}")]
    Decompress {
        kind: CompressionKind,
        message: String,
    },
}
