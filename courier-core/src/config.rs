//! Transfer settings shared by sender and receiver.

use std::time::Duration;

use crate::codec::{CompressionKind, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Default wait for each chunk's acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default sends per chunk before the transfer is abandoned.
pub const DEFAULT_ATTEMPT_BUDGET: u32 = 3;

/// Pause after `FILE_START` so the receiver can set up before chunks arrive.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(1);

/// Receiver ticks (one per second) without traffic before an open transfer is dropped.
pub const DEFAULT_IDLE_TIMEOUT_TICKS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub attempt_budget: u32,
    pub start_delay: Duration,
    pub compression: CompressionKind,
    pub idle_timeout_ticks: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            attempt_budget: DEFAULT_ATTEMPT_BUDGET,
            start_delay: DEFAULT_START_DELAY,
            compression: CompressionKind::None,
            idle_timeout_ticks: DEFAULT_IDLE_TIMEOUT_TICKS,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.attempt_budget == 0 {
            return Err(ConfigError::AttemptBudget);
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::AckTimeout);
        }
        if self.idle_timeout_ticks == 0 {
            return Err(ConfigError::IdleTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be between 1 and {MAX_CHUNK_SIZE}, got {0}")]
    ChunkSize(usize),
    #[error("attempt budget must be at least 1")]
    AttemptBudget,
    #[error("ack timeout must be non-zero")]
    AckTimeout,
    #[error("idle timeout must be at least one tick")]
    IdleTimeout,
}
