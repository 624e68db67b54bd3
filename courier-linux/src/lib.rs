//! Mesh Courier Linux host: UDP text channel, transfer link, persistence, config and CLI.

pub mod cli;
pub mod config;
pub mod link;
pub mod logging;
pub mod persist;
pub mod transport;

pub use link::{Link, LinkEvent, SendError, SendReport};
pub use persist::{DirectorySink, FileSink};
pub use transport::UdpChannel;
