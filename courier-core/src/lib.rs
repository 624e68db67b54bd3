//! Mesh Courier protocol core: reliable file transfer over a lossy text channel.
//! Host-driven: no I/O; host passes frames and timeouts in and sends what comes out.

pub mod admission;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod transport;
pub mod wire;

pub use codec::{CompressionKind, DecodeError, EncodeError, SizeReport};
pub use config::{ConfigError, TransferSettings};
pub use protocol::{Frame, ParseError};
pub use receiver::{ReceivedFile, ReceiverEvent, ReceiverSession, ReceiverState, TransferMetadata};
pub use sender::{ChunkDeliveryFailed, SenderSession, SenderState, SenderStep, SessionError};
pub use transport::{MessageHandler, SubscriptionId, Transport, TransportError};
pub use wire::{decode_message, encode_message, MessageDecodeError, MESSAGE_PREFIX};
