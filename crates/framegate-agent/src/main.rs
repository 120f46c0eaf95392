//! framegate relay agent
//!
//! Runs the admission runtime against live interface counters and hosts the
//! admission filter on a UDP relay:
//!
//! - Calibrates the bandwidth ceiling, then adapts the byte budget on loss
//! - Relays RTP datagrams from `--listen` to `--forward`, dropping whole
//!   frames when the budget is exhausted
//! - Optionally serves Prometheus metrics

mod relay;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use framegate_core::config::AdmissionConfig;
use framegate_core::runtime::AdmissionRuntime;
use framegate_core::stats;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::relay::Relay;

/// framegate relay agent.
#[derive(Parser, Debug)]
#[command(name = "framegate-agent", about = "Frame-aware admission control relay")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Address the relay receives the video flow on; defaults to all
    /// interfaces on the flow's destination port.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Downstream address passed datagrams are forwarded to.
    #[arg(long)]
    forward: SocketAddr,

    /// Prometheus endpoint; overrides `metrics.bind` from the config.
    #[arg(long)]
    metrics: Option<SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = AdmissionConfig::from_file(&cli.config)?;
    if cli.metrics.is_some() {
        config.metrics.bind = cli.metrics;
    }
    let listen = cli.listen.unwrap_or_else(|| default_listen(&config));

    info!(
        config = %cli.config.display(),
        listen = %listen,
        forward = %cli.forward,
        interface = %config.stats.interface,
        "framegate-agent starting"
    );

    let relay = Relay::bind(listen, cli.forward, &config.flow)?;
    let mut runtime = AdmissionRuntime::start(&config, stats::from_config(&config.stats))?;

    // ── Graceful shutdown ──
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::Relaxed);
    })
    .context("Failed to install signal handler")?;

    let relayed = relay.run(runtime.filter(), &running);
    info!("received shutdown signal");
    runtime.shutdown();

    let snap = runtime.snapshot();
    let filtered = runtime.filter().stats();
    info!(
        received = relayed.received,
        forwarded = relayed.forwarded,
        dropped = relayed.dropped,
        dropped_frames = filtered.dropped_frames,
        send_errors = relayed.send_errors,
        k = snap.k,
        loss_events = snap.loss_events,
        "framegate-agent stopped"
    );
    Ok(())
}

fn default_listen(config: &AdmissionConfig) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.flow.dst_port))
}
