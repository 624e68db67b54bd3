//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use courier_core::CompressionKind;

use crate::config::Config;
use crate::logging::LogFormat;

/// Send files to a peer over a lossy text link, or receive them.
#[derive(Debug, Parser)]
#[command(name = "mesh-courier", version, about)]
pub struct Cli {
    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long = "log-format", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Config file (default: ~/.config/mesh-courier/config.toml, then /etc/mesh-courier/config.toml)
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Local UDP address
    #[arg(long = "listen", value_name = "ADDR", global = true)]
    pub listen: Option<SocketAddr>,

    /// Peer UDP address
    #[arg(long = "peer", value_name = "ADDR", global = true)]
    pub peer: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one file and wait until the peer has acknowledged every chunk
    Send {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(short = 'C', long = "compression")]
        compression: Option<CliCompression>,
        /// Sends per chunk before giving up
        #[arg(long = "attempts", value_name = "N")]
        attempts: Option<u32>,
        /// Seconds to wait for each ack
        #[arg(long = "wait", value_name = "SECS")]
        wait: Option<u64>,
        #[arg(long = "chunk-size", value_name = "N")]
        chunk_size: Option<usize>,
    },
    /// Receive files into a directory until interrupted
    Serve {
        #[arg(short = 'o', long = "output", value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Print how many chunks a file would take
    Estimate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(short = 'C', long = "compression")]
        compression: Option<CliCompression>,
        #[arg(long = "chunk-size", value_name = "N")]
        chunk_size: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliCompression {
    None,
    Zip,
    Gzip,
    Lzma,
}

impl From<CliCompression> for CompressionKind {
    fn from(c: CliCompression) -> Self {
        match c {
            CliCompression::None => CompressionKind::None,
            CliCompression::Zip => CompressionKind::Zip,
            CliCompression::Gzip => CompressionKind::Gzip,
            CliCompression::Lzma => CompressionKind::Lzma,
        }
    }
}

impl Cli {
    /// Flags win over file and environment values.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.peer {
            config.peer_addr = addr;
        }
        match &self.command {
            Command::Send {
                compression,
                attempts,
                wait,
                chunk_size,
                ..
            } => {
                if let Some(c) = compression {
                    config.compression = CompressionKind::from(*c).tag().to_string();
                }
                if let Some(n) = attempts {
                    config.max_attempts = *n;
                }
                if let Some(secs) = wait {
                    config.ack_timeout_secs = *secs;
                }
                if let Some(n) = chunk_size {
                    config.chunk_size = *n;
                }
            }
            Command::Serve { output } => {
                if let Some(dir) = output {
                    config.output_dir = dir.clone();
                }
            }
            Command::Estimate {
                compression,
                chunk_size,
                ..
            } => {
                if let Some(c) = compression {
                    config.compression = CompressionKind::from(*c).tag().to_string();
                }
                if let Some(n) = chunk_size {
                    config.chunk_size = *n;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_send_with_overrides() {
        let cli = Cli::try_parse_from([
            "mesh-courier",
            "-vv",
            "--peer",
            "10.1.1.2:47801",
            "send",
            "data.csv",
            "-C",
            "gzip",
            "--attempts",
            "5",
            "--wait",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.peer_addr, "10.1.1.2:47801".parse().unwrap());
        assert_eq!(config.compression, "gzip");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.ack_timeout_secs, 2);
        assert_eq!(config.chunk_size, Config::default().chunk_size);
        match cli.command {
            Command::Send { file, .. } => assert_eq!(file, PathBuf::from("data.csv")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_serve_output_and_json_logs() {
        let cli = Cli::try_parse_from(["mesh-courier", "serve", "-o", "/tmp/in", "--log-format", "json"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/in"));
    }

    #[test]
    fn rejects_unknown_compression() {
        assert!(Cli::try_parse_from(["mesh-courier", "estimate", "a.txt", "-C", "bzip2"]).is_err());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["mesh-courier"]).is_err());
    }
}
