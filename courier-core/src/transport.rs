//! Transport seam: send one text message, subscribe to incoming ones.
//! Implemented by the host (radio, serial, UDP); the core never calls it directly.

use std::sync::Arc;

/// Callback invoked once per inbound text message, in arrival order.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`Transport::subscribe`], used to detach again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A best-effort, message-oriented text channel to "the other party".
/// Messages may be dropped, duplicated or reordered.
pub trait Transport: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), TransportError>;

    fn subscribe(&self, handler: MessageHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    fn is_connected(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no active connection")]
    Unavailable,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
