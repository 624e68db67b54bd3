//! Link: one attachment to a transport. Owns the receiver session, routes acks to the
//! active send, and drives the sender state machine with per-chunk ack timeouts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::{
    admission, decode_message, encode_message, ChunkDeliveryFailed, ConfigError, DecodeError,
    Frame, MessageHandler, ReceiverEvent, ReceiverSession, SenderSession, SenderStep,
    SessionError, SubscriptionId, TransferMetadata, TransferSettings, Transport, TransportError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persist::{self, FileSink};
use crate::transport::lock;

/// Receiver idle-expiry tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type AckSlot = Arc<Mutex<Option<mpsc::UnboundedSender<u32>>>>;

/// Receive-side outcomes reported to whoever attached the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Started(TransferMetadata),
    /// An open inbound transfer was dropped because the peer announced a new one.
    Superseded {
        previous: TransferMetadata,
        received: u32,
        expected: u32,
    },
    Saved {
        filename: String,
        path: PathBuf,
        bytes: usize,
    },
    PersistFailed {
        filename: String,
        error: String,
    },
    Incomplete {
        received: u32,
        expected: u32,
    },
    Failed(DecodeError),
    Expired {
        received: u32,
        expected: u32,
    },
}

/// Summary of a finished outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub filename: String,
    pub total_chunks: u32,
    /// Chunk sends beyond the first attempt.
    pub retransmissions: u32,
    pub elapsed: Duration,
}

pub struct Link {
    transport: Arc<dyn Transport>,
    subscription: SubscriptionId,
    settings: watch::Sender<TransferSettings>,
    ack_slot: AckSlot,
    dispatch: JoinHandle<()>,
}

impl Link {
    /// Subscribe to `transport` and start the dispatch task. Must run inside a tokio runtime.
    pub fn attach(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FileSink>,
        settings: TransferSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), ConfigError> {
        settings.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (settings_tx, settings_rx) = watch::channel(settings);
        let ack_slot: AckSlot = Arc::new(Mutex::new(None));

        let handler: MessageHandler = Arc::new(move |text: &str| {
            let _ = inbound_tx.send(text.to_string());
        });
        let subscription = transport.subscribe(handler);

        let dispatcher = Dispatcher {
            transport: transport.clone(),
            sink,
            ack_slot: ack_slot.clone(),
            events: events_tx,
        };
        let dispatch = tokio::spawn(dispatcher.run(inbound_rx, settings_rx));
        debug!(?subscription, "link attached");

        Ok((
            Self {
                transport,
                subscription,
                settings: settings_tx,
                ack_slot,
                dispatch,
            },
            events_rx,
        ))
    }

    pub fn settings(&self) -> TransferSettings {
        self.settings.borrow().clone()
    }

    /// Replace the settings. Timeout and budget changes reach a running send, including its current wait.
    pub fn update_settings(&self, settings: TransferSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        info!(
            ack_timeout = ?settings.ack_timeout,
            attempt_budget = settings.attempt_budget,
            chunk_size = settings.chunk_size,
            "transfer settings updated"
        );
        self.settings.send_replace(settings);
        Ok(())
    }

    /// True while a send occupies the link.
    pub fn is_sending(&self) -> bool {
        lock(&self.ack_slot).is_some()
    }

    /// Admission check, read, then [`Link::send_bytes`] under the file's own name.
    pub async fn send_file(&self, path: &Path) -> Result<SendReport, SendError> {
        if !admission::is_allowed(path) {
            return Err(SendError::DisallowedExtension(path.to_path_buf()));
        }
        let filename = admission::announced_name(path)
            .ok_or_else(|| SendError::InvalidPath(path.to_path_buf()))?;
        if !self.transport.is_connected() {
            return Err(TransportError::Unavailable.into());
        }
        let data = persist::read_source(path)?;
        self.send_bytes(&filename, &data).await
    }

    /// Run one stop-and-wait transfer of `data` announced as `filename`.
    pub async fn send_bytes(&self, filename: &str, data: &[u8]) -> Result<SendReport, SendError> {
        if !self.transport.is_connected() {
            return Err(TransportError::Unavailable.into());
        }
        let settings = self.settings();
        let mut session = SenderSession::new(
            filename,
            data,
            settings.compression,
            settings.chunk_size,
            settings.attempt_budget,
        )?;
        let mut settings_rx = self.settings.subscribe();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let _claim = SendClaim::acquire(&self.ack_slot, ack_tx)?;
        let started = Instant::now();

        info!(
            filename,
            total_chunks = session.total_chunks(),
            compression = %settings.compression,
            "sending file"
        );
        if let Some(announce) = session.start() {
            self.send_frame(&announce)?;
        }
        if !settings.start_delay.is_zero() {
            tokio::time::sleep(settings.start_delay).await;
        }

        let mut retransmissions = 0u32;
        let mut step = session.announced();
        loop {
            match step {
                Some(SenderStep::Transmit(frame)) => {
                    self.send_frame(&frame)?;
                    let sent_at = tokio::time::Instant::now();
                    let mut ack_timeout = self.apply_current(&mut settings_rx, &mut session);
                    step = loop {
                        tokio::select! {
                            res = tokio::time::timeout_at(sent_at + ack_timeout, ack_rx.recv()) => match res {
                                Ok(Some(index)) => match session.on_ack(index) {
                                    Some(next) => {
                                        debug!(index, "ack received");
                                        break Some(next);
                                    }
                                    None => debug!(index, awaiting = ?session.awaiting(), "stale ack ignored"),
                                },
                                Ok(None) => return Err(TransportError::Unavailable.into()),
                                Err(_) => {
                                    let next = session.on_timeout();
                                    if let Some(SenderStep::Transmit(Frame::Chunk { index, .. })) = &next {
                                        retransmissions += 1;
                                        warn!(index, "no ack, retrying");
                                    }
                                    break next;
                                }
                            },
                            Ok(()) = settings_rx.changed() => {
                                ack_timeout = self.apply_current(&mut settings_rx, &mut session);
                                debug!(?ack_timeout, budget = session.attempt_budget(), "settings changed during wait");
                            }
                        }
                    };
                }
                Some(SenderStep::Complete) => {
                    if let Some(end) = session.finish() {
                        self.send_frame(&end)?;
                    }
                    let report = SendReport {
                        filename: filename.to_string(),
                        total_chunks: session.total_chunks(),
                        retransmissions,
                        elapsed: started.elapsed(),
                    };
                    info!(filename, retransmissions, elapsed = ?report.elapsed, "file sent");
                    return Ok(report);
                }
                Some(SenderStep::Abort(failed)) => {
                    warn!(index = failed.index, attempts = failed.attempts, "transfer aborted");
                    return Err(failed.into());
                }
                None => return Err(SendError::Stalled),
            }
        }
    }

    /// Push the latest budget into `session`; returns the ack timeout to wait with.
    fn apply_current(
        &self,
        settings_rx: &mut watch::Receiver<TransferSettings>,
        session: &mut SenderSession,
    ) -> Duration {
        let current = settings_rx.borrow_and_update();
        session.set_attempt_budget(current.attempt_budget);
        current.ack_timeout
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        debug!(keyword = frame.keyword(), "send frame");
        self.transport.send_text(&encode_message(frame))
    }

    /// Unsubscribe from the transport and stop the dispatch task.
    pub fn detach(self) {
        debug!(subscription = ?self.subscription, "link detached");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.subscription);
        self.dispatch.abort();
    }
}

/// Single-slot guard: one outbound transfer per link. Frees the slot on drop.
struct SendClaim<'a> {
    slot: &'a AckSlot,
}

impl<'a> SendClaim<'a> {
    fn acquire(slot: &'a AckSlot, acks: mpsc::UnboundedSender<u32>) -> Result<Self, SendError> {
        let mut current = lock(slot);
        if current.is_some() {
            return Err(SendError::Busy);
        }
        *current = Some(acks);
        Ok(Self { slot })
    }
}

impl Drop for SendClaim<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

/// Owns the receiver session; the only consumer of inbound text.
struct Dispatcher {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn FileSink>,
    ack_slot: AckSlot,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Dispatcher {
    async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<String>,
        mut settings: watch::Receiver<TransferSettings>,
    ) {
        let mut receiver =
            ReceiverSession::with_idle_timeout(settings.borrow().idle_timeout_ticks);
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                text = inbound.recv() => {
                    let Some(text) = text else { break };
                    self.on_message(&mut receiver, &text);
                }
                _ = ticker.tick() => {
                    let events = receiver.tick();
                    self.apply(events);
                }
                changed = settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    receiver.set_idle_timeout(settings.borrow().idle_timeout_ticks);
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    fn on_message(&self, receiver: &mut ReceiverSession, text: &str) {
        match decode_message(text) {
            Ok(Frame::Ack { index }) => self.route_ack(index),
            Ok(frame) => {
                let events = receiver.on_frame(frame);
                self.apply(events);
            }
            Err(e) if e.is_ignorable() => {}
            Err(e) => warn!(error = %e, "dropping bad frame"),
        }
    }

    fn route_ack(&self, index: u32) {
        match lock(&self.ack_slot).as_ref() {
            Some(acks) => {
                let _ = acks.send(index);
            }
            None => debug!(index, "ack with no send in flight"),
        }
    }

    fn apply(&self, events: Vec<ReceiverEvent>) {
        for event in events {
            let report = match event {
                ReceiverEvent::Send(frame) => {
                    if let Err(e) = self.transport.send_text(&encode_message(&frame)) {
                        warn!(error = %e, keyword = frame.keyword(), "reply not sent");
                    }
                    continue;
                }
                ReceiverEvent::Started(meta) => LinkEvent::Started(meta),
                ReceiverEvent::Superseded {
                    previous,
                    received,
                    expected,
                } => LinkEvent::Superseded {
                    previous,
                    received,
                    expected,
                },
                ReceiverEvent::Completed(file) => match self.sink.save(&file.filename, &file.data) {
                    Ok(path) => {
                        info!(filename = %file.filename, path = %path.display(), "file saved");
                        LinkEvent::Saved {
                            filename: file.filename,
                            path,
                            bytes: file.data.len(),
                        }
                    }
                    Err(e) => {
                        warn!(filename = %file.filename, error = %e, "saving file failed");
                        LinkEvent::PersistFailed {
                            filename: file.filename,
                            error: e.to_string(),
                        }
                    }
                },
                ReceiverEvent::Incomplete { received, expected } => {
                    LinkEvent::Incomplete { received, expected }
                }
                ReceiverEvent::Failed(e) => LinkEvent::Failed(e),
                ReceiverEvent::Expired { received, expected } => {
                    LinkEvent::Expired { received, expected }
                }
            };
            let _ = self.events.send(report);
        }
    }
}

/// An outbound transfer did not complete.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("extension not allowed: {0}")]
    DisallowedExtension(PathBuf),
    #[error("path has no usable file name: {0}")]
    InvalidPath(PathBuf),
    #[error("another transfer is in progress")]
    Busy,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reading source: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    ChunkDeliveryFailed(#[from] ChunkDeliveryFailed),
    #[error("sender stopped without finishing")]
    Stalled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::DirectorySink;
    use crate::transport::memory::MemoryChannel;
    use courier_core::{CompressionKind, MESSAGE_PREFIX};

    fn fast_settings() -> TransferSettings {
        TransferSettings {
            ack_timeout: Duration::from_millis(300),
            start_delay: Duration::ZERO,
            ..TransferSettings::default()
        }
    }

    fn strip(msgs: Vec<String>) -> Vec<String> {
        msgs.into_iter()
            .map(|m| m.strip_prefix(MESSAGE_PREFIX).unwrap_or(&m).to_string())
            .collect()
    }

    struct Pair {
        a: Arc<MemoryChannel>,
        b: Arc<MemoryChannel>,
        sender: Link,
        _receiver: Link,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        dir: tempfile::TempDir,
    }

    fn pair(settings: TransferSettings) -> Pair {
        let (a, b) = MemoryChannel::pair();
        let (a, b) = (Arc::new(a), Arc::new(b));
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn FileSink> = Arc::new(DirectorySink::new(dir.path()));
        let (sender, _) = Link::attach(a.clone(), sink.clone(), settings.clone()).unwrap();
        let (receiver, events) = Link::attach(b.clone(), sink, settings).unwrap();
        Pair {
            a,
            b,
            sender,
            _receiver: receiver,
            events,
            dir,
        }
    }

    async fn next_saved(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> PathBuf {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for link event")
                .expect("events closed");
            match event {
                LinkEvent::Started(_) => continue,
                LinkEvent::Saved { path, .. } => return path,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn single_chunk_wire_trace() {
        let mut p = pair(fast_settings());
        let report = p.sender.send_bytes("test.txt", b"abc").await.unwrap();
        assert_eq!(report.total_chunks, 1);
        assert_eq!(report.retransmissions, 0);
        let path = next_saved(&mut p.events).await;
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
        assert_eq!(
            strip(p.a.sent()),
            vec![
                "FILE_START:test.txt:1:none",
                "CHUNK:0:YWJj",
                "ACK:0",
                "FILE_END"
            ]
        );
    }

    #[tokio::test]
    async fn retries_exhaust_budget_without_acks() {
        let p = pair(TransferSettings {
            ack_timeout: Duration::from_millis(1),
            attempt_budget: 3,
            ..fast_settings()
        });
        p.a.set_drop_filter(|_| true);
        let err = p.sender.send_bytes("test.txt", b"abc").await.unwrap_err();
        assert!(matches!(
            err,
            SendError::ChunkDeliveryFailed(ChunkDeliveryFailed {
                index: 0,
                attempts: 3
            })
        ));
        let chunk_sends = strip(p.a.sent())
            .iter()
            .filter(|m| m.starts_with("CHUNK:0:"))
            .count();
        assert_eq!(chunk_sends, 3);
        assert!(!strip(p.a.sent()).contains(&"FILE_END".to_string()));
        assert!(!p.sender.is_sending());
    }

    #[tokio::test]
    async fn lost_acks_are_recovered_by_reack() {
        let mut p = pair(fast_settings());
        // First ack of every chunk is lost on the way back.
        let seen = Mutex::new(std::collections::HashSet::new());
        p.b.set_drop_filter(move |text| {
            text.contains(":ACK:") && lock(&seen).insert(text.to_string())
        });
        let data = b"several chunks of csv data\n".repeat(20);
        let report = p.sender.send_bytes("data.csv", &data).await.unwrap();
        assert!(report.total_chunks > 1);
        assert_eq!(report.retransmissions, report.total_chunks);
        let path = next_saved(&mut p.events).await;
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn duplicated_chunks_do_not_confuse_either_side() {
        let mut p = pair(TransferSettings {
            compression: CompressionKind::Gzip,
            ..fast_settings()
        });
        p.a.set_duplicate_filter(|text| text.contains(":CHUNK:"));
        let data = b"{\"temp\": 21.5, \"hum\": 40}\n".repeat(40);
        let report = p.sender.send_bytes("log.json", &data).await.unwrap();
        assert_eq!(report.retransmissions, 0);
        let path = next_saved(&mut p.events).await;
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[tokio::test]
    async fn second_send_while_busy_is_rejected() {
        let p = pair(TransferSettings {
            ack_timeout: Duration::from_millis(200),
            attempt_budget: 1,
            ..fast_settings()
        });
        p.a.set_drop_filter(|_| true);
        let first = p.sender.send_bytes("one.txt", b"abc");
        let second = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.sender.send_bytes("two.txt", b"def").await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(SendError::ChunkDeliveryFailed(_))));
        assert!(matches!(second, Err(SendError::Busy)));
    }

    #[tokio::test]
    async fn disconnected_transport_rejects_before_any_frame() {
        let p = pair(fast_settings());
        p.a.disconnect();
        let err = p.sender.send_bytes("test.txt", b"abc").await.unwrap_err();
        assert!(matches!(err, SendError::Transport(TransportError::Unavailable)));
        assert!(p.a.sent().is_empty());
    }

    #[tokio::test]
    async fn disallowed_extension_is_rejected_preflight() {
        let p = pair(fast_settings());
        let path = p.dir.path().join("tool.exe");
        std::fs::write(&path, b"MZ").unwrap();
        let err = p.sender.send_file(&path).await.unwrap_err();
        assert!(matches!(err, SendError::DisallowedExtension(_)));
        assert!(p.a.sent().is_empty());
    }

    #[tokio::test]
    async fn send_file_uses_basename() {
        let mut p = pair(fast_settings());
        let src_dir = tempfile::tempdir().unwrap();
        let path = src_dir.path().join("readings.csv");
        std::fs::write(&path, b"t,v\n1,2\n").unwrap();
        p.sender.send_file(&path).await.unwrap();
        let saved = next_saved(&mut p.events).await;
        assert_eq!(saved, p.dir.path().join("readings.csv"));
    }

    #[tokio::test]
    async fn settings_update_is_validated() {
        let p = pair(fast_settings());
        let bad = TransferSettings {
            attempt_budget: 0,
            ..fast_settings()
        };
        assert_eq!(p.sender.update_settings(bad), Err(ConfigError::AttemptBudget));
        let good = TransferSettings {
            attempt_budget: 7,
            ..fast_settings()
        };
        p.sender.update_settings(good).unwrap();
        assert_eq!(p.sender.settings().attempt_budget, 7);
    }

    #[tokio::test]
    async fn settings_update_reaches_running_send() {
        let p = pair(TransferSettings {
            ack_timeout: Duration::from_secs(30),
            attempt_budget: 5,
            ..fast_settings()
        });
        p.a.set_drop_filter(|_| true);
        let started = Instant::now();
        let update = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(p.sender.is_sending());
            p.sender
                .update_settings(TransferSettings {
                    ack_timeout: Duration::from_millis(20),
                    attempt_budget: 1,
                    ..fast_settings()
                })
                .unwrap();
        };
        let (result, ()) = tokio::join!(p.sender.send_bytes("test.txt", b"abc"), update);
        assert!(matches!(
            result,
            Err(SendError::ChunkDeliveryFailed(ChunkDeliveryFailed {
                index: 0,
                attempts: 1
            }))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        let chunk_sends = strip(p.a.sent())
            .iter()
            .filter(|m| m.starts_with("CHUNK:0:"))
            .count();
        assert_eq!(chunk_sends, 1);
    }

    #[tokio::test]
    async fn raised_budget_allows_more_retries() {
        let p = pair(TransferSettings {
            ack_timeout: Duration::from_millis(100),
            attempt_budget: 1,
            ..fast_settings()
        });
        p.a.set_drop_filter(|_| true);
        let update = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.sender
                .update_settings(TransferSettings {
                    ack_timeout: Duration::from_millis(100),
                    attempt_budget: 3,
                    ..fast_settings()
                })
                .unwrap();
        };
        let (result, ()) = tokio::join!(p.sender.send_bytes("test.txt", b"abc"), update);
        assert!(matches!(
            result,
            Err(SendError::ChunkDeliveryFailed(ChunkDeliveryFailed {
                index: 0,
                attempts: 3
            }))
        ));
    }

    #[tokio::test]
    async fn detach_unsubscribes() {
        let (a, _b) = MemoryChannel::pair();
        let a = Arc::new(a);
        let dir = tempfile::tempdir().unwrap();
        let (link, _events) = Link::attach(
            a.clone(),
            Arc::new(DirectorySink::new(dir.path())),
            fast_settings(),
        )
        .unwrap();
        assert_eq!(a.subscriber_count(), 1);
        link.detach();
        assert_eq!(a.subscriber_count(), 0);
    }
}
