//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_core::{CompressionKind, ConfigError, TransferSettings};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/mesh-courier/config.toml or /etc/mesh-courier/config.toml.
/// Env overrides: COURIER_LISTEN_ADDR, COURIER_PEER_ADDR, COURIER_OUTPUT_DIR, COURIER_CHUNK_SIZE,
/// COURIER_ACK_TIMEOUT_SECS, COURIER_MAX_ATTEMPTS, COURIER_COMPRESSION.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local UDP address (default 0.0.0.0:47800).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Remote UDP address (default 127.0.0.1:47801).
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,
    /// Where received files are written (default ./received).
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Seconds to wait for each ack (default 15).
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Sends per chunk before the transfer fails (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after FILE_START, milliseconds (default 1000).
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    /// none, zip, gzip or lzma.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Seconds without traffic before a half-received file is dropped (default 300).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47800))
}
fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 47801))
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("received")
}
fn default_chunk_size() -> usize {
    courier_core::codec::DEFAULT_CHUNK_SIZE
}
fn default_ack_timeout_secs() -> u64 {
    courier_core::config::DEFAULT_ACK_TIMEOUT.as_secs()
}
fn default_max_attempts() -> u32 {
    courier_core::config::DEFAULT_ATTEMPT_BUDGET
}
fn default_start_delay_ms() -> u64 {
    courier_core::config::DEFAULT_START_DELAY.as_millis() as u64
}
fn default_compression() -> String {
    CompressionKind::None.tag().to_string()
}
fn default_idle_timeout_secs() -> u64 {
    courier_core::config::DEFAULT_IDLE_TIMEOUT_TICKS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peer_addr: default_peer_addr(),
            output_dir: default_output_dir(),
            chunk_size: default_chunk_size(),
            ack_timeout_secs: default_ack_timeout_secs(),
            max_attempts: default_max_attempts(),
            start_delay_ms: default_start_delay_ms(),
            compression: default_compression(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Config {
    /// Settings handed to the link. One receiver tick is one second.
    pub fn transfer_settings(&self) -> Result<TransferSettings, LoadError> {
        let compression = self
            .compression
            .parse::<CompressionKind>()
            .map_err(|e| LoadError::Compression(e.0))?;
        let settings = TransferSettings {
            chunk_size: self.chunk_size,
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            attempt_budget: self.max_attempts,
            start_delay: Duration::from_millis(self.start_delay_ms),
            compression,
            idle_timeout_ticks: self.idle_timeout_secs,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from `lookup` (normally the process environment). Unparsable values are skipped.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable override");
                    None
                }
            }
        }
        if let Some(v) = parsed(&lookup, "COURIER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = parsed(&lookup, "COURIER_PEER_ADDR") {
            self.peer_addr = v;
        }
        if let Some(v) = lookup("COURIER_OUTPUT_DIR").filter(|s| !s.is_empty()) {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "COURIER_CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = parsed(&lookup, "COURIER_ACK_TIMEOUT_SECS") {
            self.ack_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "COURIER_MAX_ATTEMPTS") {
            self.max_attempts = v;
        }
        if let Some(v) = lookup("COURIER_COMPRESSION").filter(|s| !s.is_empty()) {
            self.compression = v.trim().to_ascii_lowercase();
        }
    }
}

/// Load config: default, then the first config file found (or `explicit`), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, LoadError> {
    let mut c = match explicit {
        Some(path) => load_from(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_from(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok());
    Ok(c)
}

/// Parse one config file.
pub fn load_from(path: &Path) -> Result<Config, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mesh-courier/config.toml"));
    }
    out.push(PathBuf::from("/etc/mesh-courier/config.toml"));
    out
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown compression {0:?}")]
    Compression(String),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}
