//! Text-message transports: UDP datagrams between two addresses, and an in-memory pair.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_core::{MessageHandler, SubscriptionId, Transport, TransportError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest datagram accepted on receive; channel messages are far smaller.
const MAX_DATAGRAM: usize = 4096;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registered message handlers for one endpoint.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, MessageHandler)>>,
}

impl Subscribers {
    pub fn add(&self, handler: MessageHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push((id, handler));
        id
    }

    pub fn remove(&self, id: SubscriptionId) {
        lock(&self.handlers).retain(|(h, _)| *h != id);
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `text`. Handlers run outside the lock.
    pub fn dispatch(&self, text: &str) {
        let handlers: Vec<MessageHandler> =
            lock(&self.handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(text);
        }
    }
}

/// One UDP datagram per text message, sent to a fixed peer address.
/// Stands in for the radio link: best effort, no ordering, no retries.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: Mutex<SocketAddr>,
    subscribers: Arc<Subscribers>,
    connected: Arc<AtomicBool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// Bind `local` and start delivering inbound datagrams to subscribers.
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let subscribers = Arc::new(Subscribers::default());
        let connected = Arc::new(AtomicBool::new(true));
        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            subscribers.clone(),
            connected.clone(),
        ));
        debug!(local = %socket.local_addr()?, %peer, "udp channel bound");
        Ok(Self {
            socket,
            peer: Mutex::new(peer),
            subscribers,
            connected,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        *lock(&self.peer)
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        *lock(&self.peer) = peer;
    }

    /// Stop receiving; later sends fail with `Unavailable`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.recv_task).take() {
            task.abort();
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for UdpChannel {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable);
        }
        let peer = self.peer();
        best_effort(self.socket.try_send_to(text.as_bytes(), peer), peer)
    }

    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId {
        self.subscribers.add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// `WouldBlock` is a lost message, not a failure.
fn best_effort(sent: io::Result<usize>, peer: SocketAddr) -> Result<(), TransportError> {
    match sent {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!(%peer, "socket busy, datagram dropped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, subscribers: Arc<Subscribers>, connected: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => match std::str::from_utf8(&buf[..n]) {
                Ok(text) => subscribers.dispatch(text),
                Err(_) => debug!(%from, len = n, "non-text datagram ignored"),
            },
            Err(e) => {
                warn!(error = %e, "udp receive failed, closing channel");
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

pub mod memory {
    //! In-memory channel pair for tests and local demos, with loss and duplication knobs.

    use super::*;

    pub type MessageFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

    #[derive(Default)]
    struct Knobs {
        drop: Option<MessageFilter>,
        duplicate: Option<MessageFilter>,
    }

    /// One end of a linked pair. What one end sends, the other end's subscribers receive.
    pub struct MemoryChannel {
        own: Arc<Subscribers>,
        peer: Arc<Subscribers>,
        connected: Arc<AtomicBool>,
        log: Arc<Mutex<Vec<String>>>,
        knobs: Mutex<Knobs>,
    }

    impl MemoryChannel {
        pub fn pair() -> (MemoryChannel, MemoryChannel) {
            let a = Arc::new(Subscribers::default());
            let b = Arc::new(Subscribers::default());
            let connected = Arc::new(AtomicBool::new(true));
            let log = Arc::new(Mutex::new(Vec::new()));
            let end = |own: &Arc<Subscribers>, peer: &Arc<Subscribers>| MemoryChannel {
                own: own.clone(),
                peer: peer.clone(),
                connected: connected.clone(),
                log: log.clone(),
                knobs: Mutex::new(Knobs::default()),
            };
            (end(&a, &b), end(&b, &a))
        }

        /// Outgoing messages for which `filter` returns true are lost.
        pub fn set_drop_filter(&self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) {
            lock(&self.knobs).drop = Some(Box::new(filter));
        }

        /// Outgoing messages for which `filter` returns true are delivered twice.
        pub fn set_duplicate_filter(&self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) {
            lock(&self.knobs).duplicate = Some(Box::new(filter));
        }

        /// Every message transmitted by either end, in send order (lost ones included).
        pub fn sent(&self) -> Vec<String> {
            lock(&self.log).clone()
        }

        /// Take both ends down.
        pub fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        pub fn subscriber_count(&self) -> usize {
            self.own.len()
        }
    }

    impl Transport for MemoryChannel {
        fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if !self.is_connected() {
                return Err(TransportError::Unavailable);
            }
            lock(&self.log).push(text.to_string());
            let (dropped, copies) = {
                let knobs = lock(&self.knobs);
                let dropped = knobs.drop.as_ref().is_some_and(|f| f(text));
                let duplicated = knobs.duplicate.as_ref().is_some_and(|f| f(text));
                (dropped, if duplicated { 2 } else { 1 })
            };
            if dropped {
                return Ok(());
            }
            for _ in 0..copies {
                self.peer.dispatch(text);
            }
            Ok(())
        }

        fn subscribe(&self, handler: MessageHandler) -> SubscriptionId {
            self.own.add(handler)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.own.remove(id);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
