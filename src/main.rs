//! skirmish - headless authoritative match host.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{HostConfig, DEFAULT_CONFIG_PATH};
use skirmish_client::MatchClient;
use skirmish_net::protocol::Ping;
use skirmish_net::LoopbackHub;
use skirmish_server::MatchHost;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Headless match host for remote and in-process players",
    long_about = None
)]
struct Args {
    /// Host configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the listen address from the config file
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Do not accept remote players
    #[arg(long)]
    no_network: bool,
    /// Attach an in-process client over a loopback link (editor test mode)
    #[arg(long)]
    local_client: bool,
    /// Override the terrain seed
    #[arg(long)]
    seed: Option<u64>,
    /// Stop after this many simulation ticks
    #[arg(long)]
    ticks: Option<u64>,
    /// Write the effective configuration back to the config path and exit
    #[arg(long)]
    write_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting skirmish v{}", env!("CARGO_PKG_VERSION"));

    let mut cfg = HostConfig::load_from_path(&args.config);
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if let Some(seed) = args.seed {
        cfg.host.match_config.seed = seed;
    }
    if args.no_network {
        cfg.network = false;
    }
    if args.write_config {
        cfg.save_to_path(&args.config)
            .with_context(|| format!("Failed to write {}", args.config.display()))?;
        info!("Configuration written to {}", args.config.display());
        return Ok(());
    }

    let mut host = MatchHost::new(cfg.host.clone()).context("Failed to create match")?;
    if cfg.network {
        host.listen(cfg.listen)?;
    } else if !args.local_client {
        warn!("Network disabled and no local client; the match will run empty");
    }

    let mut local = if args.local_client {
        let (host_end, guest_end) = LoopbackHub::pair();
        let peer = host.attach_local(host_end);
        info!(%peer, "Local client attached");
        Some(MatchClient::local(guest_end)?)
    } else {
        None
    };

    run(&mut host, local.as_mut(), args.ticks)?;

    if let Some(client) = local.as_mut() {
        client.disconnect("host stopping");
    }
    host.shutdown("host stopping");
    // One more pass so peers see the close before the driver drops.
    host.update(Duration::ZERO);
    info!(tick = host.tick().0, "Match stopped");
    Ok(())
}

fn run(
    host: &mut MatchHost,
    mut local: Option<&mut MatchClient>,
    max_ticks: Option<u64>,
) -> Result<()> {
    let step = host.world().step_duration();
    let tick_rate = u64::from(host.world().config().tick_rate);
    let mut last = Instant::now();
    let mut nonce = 0u32;

    loop {
        let now = Instant::now();
        let frame = host.update(now - last);
        last = now;

        if let Some(client) = local.as_deref_mut() {
            client.update();
            let tick = host.tick().0;
            if frame.steps > 0 && tick % tick_rate == 0 && client.is_connected() {
                nonce = nonce.wrapping_add(1);
                client.send(&Ping { nonce })?;
                debug!(pongs = client.view().pongs().len(), "Local client ping");
            }
        }

        if frame.steps > 1 {
            debug!(steps = frame.steps, "Host fell behind wall clock");
        }
        if max_ticks.is_some_and(|limit| host.tick().0 >= limit) {
            return Ok(());
        }
        std::thread::sleep(step / 4);
    }
}
