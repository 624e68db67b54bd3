//! Receiver session: buffers chunks arriving in any order, detects completion,
//! reassembles and decodes the file.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::codec::{self, CompressionKind, DecodeError};
use crate::config::DEFAULT_IDLE_TIMEOUT_TICKS;
use crate::protocol::Frame;

/// Announced by `FILE_START`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub filename: String,
    pub total_chunks: u32,
    pub compression: CompressionKind,
}

/// Decoded file ready for the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub compression: CompressionKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitingStart,
    Collecting,
    Reassembling,
    /// Bytes handed out via [`ReceiverEvent::Completed`].
    Saved,
    Incomplete { received: u32, expected: u32 },
    Failed(DecodeError),
    /// Dropped after too many idle ticks.
    Expired { received: u32, expected: u32 },
}

impl ReceiverState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ReceiverState::Collecting | ReceiverState::Reassembling
        )
    }
}

/// Output of the receiver for the host to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// Send this frame back to the peer.
    Send(Frame),
    Started(TransferMetadata),
    /// A `FILE_START` arrived while a transfer was open; that transfer was dropped.
    Superseded {
        previous: TransferMetadata,
        received: u32,
        expected: u32,
    },
    Completed(ReceivedFile),
    Incomplete { received: u32, expected: u32 },
    Failed(DecodeError),
    Expired { received: u32, expected: u32 },
}

pub struct ReceiverSession {
    metadata: Option<TransferMetadata>,
    received: BTreeMap<u32, String>,
    state: ReceiverState,
    idle_ticks: u64,
    idle_timeout_ticks: u64,
}

impl ReceiverSession {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT_TICKS)
    }

    pub fn with_idle_timeout(ticks: u64) -> Self {
        Self {
            metadata: None,
            received: BTreeMap::new(),
            state: ReceiverState::AwaitingStart,
            idle_ticks: 0,
            idle_timeout_ticks: ticks.max(1),
        }
    }

    pub fn set_idle_timeout(&mut self, ticks: u64) {
        self.idle_timeout_ticks = ticks.max(1);
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.metadata.as_ref()
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.received.contains_key(&index)
    }

    pub fn chunk(&self, index: u32) -> Option<&str> {
        self.received.get(&index).map(String::as_str)
    }

    /// Feed one parsed frame. `Ack` frames are not receiver input and are ignored.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<ReceiverEvent> {
        match frame {
            Frame::FileStart {
                filename,
                total_chunks,
                compression,
            } => self.on_file_start(TransferMetadata {
                filename,
                total_chunks,
                compression,
            }),
            Frame::Chunk { index, payload } => self.on_chunk(index, payload),
            Frame::FileEnd => self.on_file_end(),
            Frame::Ack { .. } => Vec::new(),
        }
    }

    /// Host calls this once per second; expires a transfer that has gone quiet.
    pub fn tick(&mut self) -> Vec<ReceiverEvent> {
        if self.state != ReceiverState::Collecting {
            return Vec::new();
        }
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if self.idle_ticks <= self.idle_timeout_ticks {
            return Vec::new();
        }
        let (received, expected) = self.progress();
        warn!(received, expected, "transfer idle too long, abandoning");
        self.state = ReceiverState::Expired { received, expected };
        vec![ReceiverEvent::Expired { received, expected }]
    }

    /// Every `FILE_START` opens a fresh transfer. An open one is dropped with all its chunks.
    fn on_file_start(&mut self, offered: TransferMetadata) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();
        if self.state == ReceiverState::Collecting {
            if let Some(previous) = self.metadata.take() {
                let (received, expected) = (self.received_count(), previous.total_chunks);
                warn!(
                    previous = %previous.filename,
                    offered = %offered.filename,
                    received,
                    expected,
                    "open transfer superseded by a new FILE_START"
                );
                events.push(ReceiverEvent::Superseded {
                    previous,
                    received,
                    expected,
                });
            }
        } else if let Some(previous) = &self.metadata {
            debug!(filename = %previous.filename, state = ?self.state, "discarding previous transfer state");
        }
        info!(
            filename = %offered.filename,
            total_chunks = offered.total_chunks,
            compression = %offered.compression,
            "receiving file"
        );
        self.received.clear();
        self.metadata = Some(offered.clone());
        self.state = ReceiverState::Collecting;
        self.idle_ticks = 0;
        events.push(ReceiverEvent::Started(offered));
        events
    }

    fn on_chunk(&mut self, index: u32, payload: String) -> Vec<ReceiverEvent> {
        let Some(meta) = self.metadata.as_ref().filter(|_| self.state == ReceiverState::Collecting)
        else {
            debug!(index, "chunk outside a transfer dropped");
            return Vec::new();
        };
        if index >= meta.total_chunks {
            warn!(index, total_chunks = meta.total_chunks, "chunk index out of range dropped");
            return Vec::new();
        }
        self.idle_ticks = 0;
        if self.received.contains_key(&index) {
            debug!(index, "duplicate chunk ignored");
        } else {
            self.received.insert(index, payload);
            debug!(index, received = self.received.len(), "chunk stored");
        }
        vec![ReceiverEvent::Send(Frame::Ack { index })]
    }

    fn on_file_end(&mut self) -> Vec<ReceiverEvent> {
        if self.state != ReceiverState::Collecting {
            debug!("FILE_END outside a transfer ignored");
            return Vec::new();
        }
        let Some(meta) = self.metadata.clone() else {
            return Vec::new();
        };
        let (received, expected) = self.progress();
        if received != expected {
            warn!(received, expected, "missing chunks, file incomplete");
            self.state = ReceiverState::Incomplete { received, expected };
            return vec![ReceiverEvent::Incomplete { received, expected }];
        }
        self.state = ReceiverState::Reassembling;
        match self.reassemble(&meta) {
            Ok(file) => {
                info!(filename = %file.filename, bytes = file.data.len(), "file reassembled");
                self.state = ReceiverState::Saved;
                vec![ReceiverEvent::Completed(file)]
            }
            Err(e) => {
                warn!(error = %e, "reassembly failed");
                self.state = ReceiverState::Failed(e.clone());
                vec![ReceiverEvent::Failed(e)]
            }
        }
    }

    /// Join payloads in index order, decode and decompress. Call only when complete.
    fn reassemble(&self, meta: &TransferMetadata) -> Result<ReceivedFile, DecodeError> {
        let ordered: Vec<&str> = self.received.values().map(String::as_str).collect();
        let data = codec::decode_payload(&ordered, meta.compression)?;
        Ok(ReceivedFile {
            filename: meta.filename.clone(),
            compression: meta.compression,
            data,
        })
    }

    fn progress(&self) -> (u32, u32) {
        let expected = self.metadata.as_ref().map_or(0, |m| m.total_chunks);
        (self.received_count(), expected)
    }
}

impl Default for ReceiverSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(filename: &str, total_chunks: u32, compression: CompressionKind) -> Frame {
        Frame::FileStart {
            filename: filename.into(),
            total_chunks,
            compression,
        }
    }

    fn chunk(index: u32, payload: &str) -> Frame {
        Frame::Chunk {
            index,
            payload: payload.into(),
        }
    }

    fn completed(events: Vec<ReceiverEvent>) -> ReceivedFile {
        match events.as_slice() {
            [ReceiverEvent::Completed(file)] => file.clone(),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    fn deliver(order: &[usize], chunks: &[String], compression: CompressionKind) -> Vec<u8> {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("out.txt", chunks.len() as u32, compression));
        for &i in order {
            rx.on_frame(chunk(i as u32, &chunks[i]));
        }
        completed(rx.on_frame(Frame::FileEnd)).data
    }

    #[test]
    fn single_chunk_file() {
        let mut rx = ReceiverSession::new();
        let events = rx.on_frame(start("test.txt", 1, CompressionKind::None));
        assert!(matches!(events.as_slice(), [ReceiverEvent::Started(_)]));
        assert_eq!(rx.state(), &ReceiverState::Collecting);
        assert_eq!(
            rx.on_frame(chunk(0, "YWJj")),
            vec![ReceiverEvent::Send(Frame::Ack { index: 0 })]
        );
        let file = completed(rx.on_frame(Frame::FileEnd));
        assert_eq!(file.filename, "test.txt");
        assert_eq!(file.data, b"abc");
        assert_eq!(rx.state(), &ReceiverState::Saved);
    }

    #[test]
    fn duplicate_chunk_is_idempotent_and_reacked() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 2, CompressionKind::None));
        let ack = vec![ReceiverEvent::Send(Frame::Ack { index: 1 })];
        assert_eq!(rx.on_frame(chunk(1, "AAAA")), ack);
        assert_eq!(rx.on_frame(chunk(1, "BBBB")), ack);
        assert_eq!(rx.received_count(), 1);
        assert_eq!(rx.chunk(1), Some("AAAA"));
    }

    #[test]
    fn out_of_order_matches_in_order() {
        let data: Vec<u8> = (0..150u32).map(|i| (i * 7) as u8).collect();
        for kind in CompressionKind::ALL {
            let chunks = codec::encode_payload(&data, kind, 40).unwrap();
            assert!(chunks.len() >= 3, "{kind}");
            let in_order: Vec<usize> = (0..chunks.len()).collect();
            let mut shuffled = in_order.clone();
            shuffled.rotate_left(2);
            assert_eq!(deliver(&in_order, &chunks, kind), data);
            assert_eq!(deliver(&shuffled, &chunks, kind), data);
        }
    }

    #[test]
    fn out_of_order_three_chunks() {
        let chunks: Vec<String> = codec::split_into_chunks(&codec::to_transport_text(b"abcdefgh"), 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            deliver(&[2, 0, 1], &chunks, CompressionKind::None),
            deliver(&[0, 1, 2], &chunks, CompressionKind::None)
        );
    }

    #[test]
    fn file_end_with_missing_chunks_is_incomplete() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 3, CompressionKind::None));
        rx.on_frame(chunk(0, "YWJj"));
        rx.on_frame(chunk(2, "YWJj"));
        assert_eq!(
            rx.on_frame(Frame::FileEnd),
            vec![ReceiverEvent::Incomplete {
                received: 2,
                expected: 3
            }]
        );
        assert_eq!(
            rx.state(),
            &ReceiverState::Incomplete {
                received: 2,
                expected: 3
            }
        );
        assert!(rx.state().is_terminal());
        // State stays inspectable, further chunks are not accepted.
        assert!(rx.has_chunk(2));
        assert!(rx.on_frame(chunk(1, "YWJj")).is_empty());
    }

    #[test]
    fn corrupt_payload_fails_reassembly() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 1, CompressionKind::Gzip));
        rx.on_frame(chunk(0, "YWJj"));
        let events = rx.on_frame(Frame::FileEnd);
        assert!(matches!(
            events.as_slice(),
            [ReceiverEvent::Failed(DecodeError::Decompress { .. })]
        ));
        assert!(matches!(rx.state(), ReceiverState::Failed(_)));
    }

    #[test]
    fn invalid_transport_text_fails_reassembly() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 1, CompressionKind::None));
        rx.on_frame(chunk(0, "!!!"));
        assert!(matches!(
            rx.on_frame(Frame::FileEnd).as_slice(),
            [ReceiverEvent::Failed(DecodeError::InvalidTransportText(_))]
        ));
    }

    #[test]
    fn chunks_before_start_are_dropped_without_ack() {
        let mut rx = ReceiverSession::new();
        assert!(rx.on_frame(chunk(0, "YWJj")).is_empty());
        assert!(rx.on_frame(Frame::FileEnd).is_empty());
        assert_eq!(rx.state(), &ReceiverState::AwaitingStart);
    }

    #[test]
    fn out_of_range_chunk_is_dropped() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 1, CompressionKind::None));
        assert!(rx.on_frame(chunk(5, "YWJj")).is_empty());
        assert_eq!(rx.received_count(), 0);
    }

    #[test]
    fn repeated_start_restarts_collection() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("notes.txt", 3, CompressionKind::None));
        rx.on_frame(chunk(0, "QUFB"));
        rx.on_frame(chunk(1, "QUFB"));
        // Same name and length: the sender restarted after aborting.
        let events = rx.on_frame(start("notes.txt", 3, CompressionKind::None));
        assert_eq!(
            events,
            vec![
                ReceiverEvent::Superseded {
                    previous: TransferMetadata {
                        filename: "notes.txt".into(),
                        total_chunks: 3,
                        compression: CompressionKind::None,
                    },
                    received: 2,
                    expected: 3,
                },
                ReceiverEvent::Started(TransferMetadata {
                    filename: "notes.txt".into(),
                    total_chunks: 3,
                    compression: CompressionKind::None,
                }),
            ]
        );
        assert_eq!(rx.received_count(), 0);
        for i in 0..3 {
            rx.on_frame(chunk(i, "QkJC"));
        }
        assert_eq!(completed(rx.on_frame(Frame::FileEnd)).data, b"BBBBBBBBB");
    }

    #[test]
    fn competing_start_replaces_open_transfer() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("first.txt", 5, CompressionKind::None));
        rx.on_frame(chunk(0, "YW"));
        rx.on_frame(chunk(1, "Jj"));
        let events = rx.on_frame(start("second.txt", 1, CompressionKind::None));
        match events.as_slice() {
            [ReceiverEvent::Superseded { previous, received: 2, expected: 5 }, ReceiverEvent::Started(now)] => {
                assert_eq!(previous.filename, "first.txt");
                assert_eq!(now.filename, "second.txt");
            }
            other => panic!("expected Superseded then Started, got {other:?}"),
        }
        // Old indices are gone; chunk 0 belongs to the new transfer.
        assert_eq!(
            rx.on_frame(chunk(0, "YWJj")),
            vec![ReceiverEvent::Send(Frame::Ack { index: 0 })]
        );
        assert!(rx.on_frame(chunk(1, "YWJj")).is_empty());
        let file = completed(rx.on_frame(Frame::FileEnd));
        assert_eq!(file.filename, "second.txt");
        assert_eq!(file.data, b"abc");
    }

    #[test]
    fn new_start_after_terminal_state_resets() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 2, CompressionKind::None));
        rx.on_frame(chunk(0, "YW"));
        rx.on_frame(Frame::FileEnd);
        let events = rx.on_frame(start("b.txt", 1, CompressionKind::None));
        assert!(matches!(events.as_slice(), [ReceiverEvent::Started(_)]));
        assert_eq!(rx.received_count(), 0);
        assert_eq!(rx.state(), &ReceiverState::Collecting);
    }

    #[test]
    fn idle_transfer_expires_and_frees_slot() {
        let mut rx = ReceiverSession::with_idle_timeout(2);
        rx.on_frame(start("a.txt", 2, CompressionKind::None));
        assert!(rx.tick().is_empty());
        rx.on_frame(chunk(0, "YW"));
        assert!(rx.tick().is_empty());
        assert!(rx.tick().is_empty());
        assert_eq!(
            rx.tick(),
            vec![ReceiverEvent::Expired {
                received: 1,
                expected: 2
            }]
        );
        let events = rx.on_frame(start("b.txt", 1, CompressionKind::None));
        assert!(matches!(events.as_slice(), [ReceiverEvent::Started(_)]));
    }

    #[test]
    fn acks_are_not_receiver_input() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("a.txt", 1, CompressionKind::None));
        assert!(rx.on_frame(Frame::Ack { index: 0 }).is_empty());
    }

    #[test]
    fn empty_file_reassembles() {
        let mut rx = ReceiverSession::new();
        rx.on_frame(start("empty.txt", 0, CompressionKind::None));
        assert!(completed(rx.on_frame(Frame::FileEnd)).data.is_empty());
    }
}
