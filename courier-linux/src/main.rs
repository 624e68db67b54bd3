// Mesh Courier: send or receive files over a UDP text link.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use courier_core::codec;
use courier_core::{admission, TransferSettings};
use courier_linux::cli::{Cli, Command};
use courier_linux::config::{self, Config};
use courier_linux::{logging, persist, DirectorySink, Link, LinkEvent, UdpChannel};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_format)
        .map_err(|e| anyhow::anyhow!("initializing logging: {e}"))?;

    let cfg = resolve_config(&cli)?;
    let settings = cfg.transfer_settings()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match &cli.command {
            Command::Send { file, .. } => send(&cfg, settings, file).await,
            Command::Serve { .. } => serve(&cli, &cfg, settings).await,
            Command::Estimate { file, .. } => estimate(file, &settings),
        }
    })
}

/// File and environment, then command-line flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut cfg);
    Ok(cfg)
}

async fn send(cfg: &Config, settings: TransferSettings, file: &Path) -> anyhow::Result<()> {
    let channel = Arc::new(UdpChannel::bind(cfg.listen_addr, cfg.peer_addr).await?);
    let sink = Arc::new(DirectorySink::new(&cfg.output_dir));
    let (link, _events) = Link::attach(channel.clone(), sink, settings)?;

    let report = link
        .send_file(file)
        .await
        .with_context(|| format!("sending {}", file.display()))?;
    println!(
        "sent {} in {} chunks ({} retransmissions, {:.1}s)",
        report.filename,
        report.total_chunks,
        report.retransmissions,
        report.elapsed.as_secs_f64()
    );
    link.detach();
    channel.close();
    Ok(())
}

async fn serve(cli: &Cli, cfg: &Config, settings: TransferSettings) -> anyhow::Result<()> {
    let channel = Arc::new(UdpChannel::bind(cfg.listen_addr, cfg.peer_addr).await?);
    let sink = Arc::new(DirectorySink::new(&cfg.output_dir));
    let (link, mut events) = Link::attach(channel.clone(), sink, settings)?;
    info!(
        listen = %channel.local_addr()?,
        peer = %cfg.peer_addr,
        output = %cfg.output_dir.display(),
        "serving"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                report(event);
            }
            _ = hangup.recv() => reload(cli, &link),
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                break;
            }
        }
    }
    link.detach();
    channel.close();
    Ok(())
}

/// SIGHUP: re-read config; the new timeout and budget apply from the next wait.
fn reload(cli: &Cli, link: &Link) {
    let settings = resolve_config(cli).and_then(|c| Ok(c.transfer_settings()?));
    match settings.and_then(|s| Ok(link.update_settings(s)?)) {
        Ok(()) => info!("config reloaded"),
        Err(e) => warn!(error = %e, "config reload failed, keeping current settings"),
    }
}

fn report(event: LinkEvent) {
    match event {
        LinkEvent::Started(meta) => info!(
            filename = %meta.filename,
            total_chunks = meta.total_chunks,
            compression = %meta.compression,
            "receiving"
        ),
        LinkEvent::Saved { path, bytes, .. } => {
            println!("received {} ({bytes} bytes)", path.display())
        }
        LinkEvent::Superseded {
            previous,
            received,
            expected,
        } => warn!(
            filename = %previous.filename,
            received,
            expected,
            "peer restarted, unfinished transfer dropped"
        ),
        LinkEvent::PersistFailed { filename, error } => {
            warn!(%filename, %error, "could not save file")
        }
        LinkEvent::Incomplete { received, expected } => {
            warn!(received, expected, "transfer ended with missing chunks")
        }
        LinkEvent::Failed(e) => warn!(error = %e, "received file could not be decoded"),
        LinkEvent::Expired { received, expected } => {
            warn!(received, expected, "transfer went idle and was dropped")
        }
    }
}

fn estimate(file: &Path, settings: &TransferSettings) -> anyhow::Result<()> {
    if !admission::is_allowed(file) {
        warn!(file = %file.display(), "extension not allowed, send would refuse this file");
    }
    let data = persist::read_source(file).with_context(|| format!("reading {}", file.display()))?;
    let size = codec::estimate(&data, settings.compression, settings.chunk_size)?;
    println!(
        "{}: {} bytes, {} compressed ({}), {} encoded, {} chunks of {}",
        file.display(),
        size.original,
        size.compressed,
        settings.compression,
        size.encoded,
        size.chunks,
        settings.chunk_size
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
