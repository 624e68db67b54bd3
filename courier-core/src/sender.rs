//! Sender session: stop-and-wait state machine for one outbound transfer.
//! Host-driven: the host sends the frames it is handed and reports acks and timeouts.

use tracing::debug;

use crate::codec::{self, CompressionKind, EncodeError};
use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    /// `FILE_START` handed out, waiting for the host to confirm it went out.
    Announcing,
    /// Chunk `index` is in flight; `attempt` counts sends of it so far (1-based).
    Transmitting { index: u32, attempt: u32 },
    /// Every chunk acknowledged; `FILE_END` still to send.
    Completing,
    Done,
    Aborted { index: u32, attempts: u32 },
}

/// What the host should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderStep {
    /// Send this chunk frame, then wait for its ack or a timeout.
    Transmit(Frame),
    /// All chunks acknowledged; call [`SenderSession::finish`].
    Complete,
    /// Budget exhausted; the transfer is over.
    Abort(ChunkDeliveryFailed),
}

/// A chunk went unacknowledged for the whole attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk {index} not acknowledged after {attempts} attempts")]
pub struct ChunkDeliveryFailed {
    pub index: u32,
    pub attempts: u32,
}

pub struct SenderSession {
    filename: String,
    compression: CompressionKind,
    chunks: Vec<String>,
    state: SenderState,
    attempt_budget: u32,
}

impl SenderSession {
    /// Build a session for `data`. Chunks are derived once here and never change.
    pub fn new(
        filename: impl Into<String>,
        data: &[u8],
        compression: CompressionKind,
        chunk_size: usize,
        attempt_budget: u32,
    ) -> Result<Self, SessionError> {
        let chunks = codec::encode_payload(data, compression, chunk_size)?;
        Self::from_chunks(filename, compression, chunks, attempt_budget)
    }

    /// Build a session from already-encoded chunks.
    pub fn from_chunks(
        filename: impl Into<String>,
        compression: CompressionKind,
        chunks: Vec<String>,
        attempt_budget: u32,
    ) -> Result<Self, SessionError> {
        let filename = filename.into();
        if filename.is_empty() || filename.contains(crate::protocol::DELIMITER) {
            return Err(SessionError::InvalidFilename(filename));
        }
        if u32::try_from(chunks.len()).is_err() {
            return Err(SessionError::TooManyChunks(chunks.len()));
        }
        Ok(Self {
            filename,
            compression,
            chunks,
            state: SenderState::Idle,
            attempt_budget: attempt_budget.max(1),
        })
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn attempt_budget(&self) -> u32 {
        self.attempt_budget
    }

    /// Change the budget mid-transfer; applies from the next timeout.
    pub fn set_attempt_budget(&mut self, budget: u32) {
        self.attempt_budget = budget.max(1);
    }

    /// Index currently awaiting acknowledgment, if any.
    pub fn awaiting(&self) -> Option<u32> {
        match self.state {
            SenderState::Transmitting { index, .. } => Some(index),
            _ => None,
        }
    }

    /// Begin the transfer: returns the `FILE_START` frame. Only valid from `Idle`.
    pub fn start(&mut self) -> Option<Frame> {
        if self.state != SenderState::Idle {
            return None;
        }
        self.state = SenderState::Announcing;
        debug!(filename = %self.filename, total_chunks = self.total_chunks(), "announcing");
        Some(Frame::FileStart {
            filename: self.filename.clone(),
            total_chunks: self.total_chunks(),
            compression: self.compression,
        })
    }

    /// `FILE_START` is out; move on to the first chunk.
    pub fn announced(&mut self) -> Option<SenderStep> {
        if self.state != SenderState::Announcing {
            return None;
        }
        Some(self.transmit_from(0))
    }

    /// Ack for `index`. Anything but the awaited index is ignored.
    pub fn on_ack(&mut self, index: u32) -> Option<SenderStep> {
        match self.state {
            SenderState::Transmitting { index: awaited, .. } if awaited == index => {
                Some(self.transmit_from(index + 1))
            }
            _ => None,
        }
    }

    /// The ack wait for the current chunk elapsed. Resend or abort.
    pub fn on_timeout(&mut self) -> Option<SenderStep> {
        let SenderState::Transmitting { index, attempt } = self.state else {
            return None;
        };
        if attempt >= self.attempt_budget {
            debug!(index, attempts = attempt, "attempt budget exhausted");
            self.state = SenderState::Aborted {
                index,
                attempts: attempt,
            };
            return Some(SenderStep::Abort(ChunkDeliveryFailed {
                index,
                attempts: attempt,
            }));
        }
        self.state = SenderState::Transmitting {
            index,
            attempt: attempt + 1,
        };
        debug!(index, attempt = attempt + 1, "resending chunk");
        Some(SenderStep::Transmit(self.chunk_frame(index)))
    }

    /// Returns `FILE_END` and marks the session done. Only valid from `Completing`.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.state != SenderState::Completing {
            return None;
        }
        self.state = SenderState::Done;
        Some(Frame::FileEnd)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SenderState::Done | SenderState::Aborted { .. })
    }

    fn transmit_from(&mut self, index: u32) -> SenderStep {
        if index >= self.total_chunks() {
            debug!(filename = %self.filename, "all chunks acknowledged");
            self.state = SenderState::Completing;
            return SenderStep::Complete;
        }
        self.state = SenderState::Transmitting { index, attempt: 1 };
        SenderStep::Transmit(self.chunk_frame(index))
    }

    fn chunk_frame(&self, index: u32) -> Frame {
        Frame::Chunk {
            index,
            payload: self.chunks[index as usize].clone(),
        }
    }
}

/// The session could not be built.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("filename {0:?} is empty or contains the frame delimiter")]
    InvalidFilename(String),
    #[error("{0} chunks exceed the frame index range")]
    TooManyChunks(usize),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
