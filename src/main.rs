use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

mod dedup;
mod packet;
mod relay;

use relay::{RelayConfig, WolRelay};

#[derive(Parser, Debug)]
#[command(name = "wol-relay")]
#[command(about = "Relays Wake-on-LAN magic packets onto a subnet their broadcast cannot reach")]
#[command(version = "1.0.0")]
struct Args {
    /// UDP port to listen on (all interfaces)
    #[arg(short, long, default_value = "40000")]
    listen_port: u16,

    /// Broadcast address of the destination subnet (e.g. 192.168.1.255)
    #[arg(short, long)]
    broadcast: IpAddr,

    /// UDP port packets are forwarded to
    #[arg(short = 'p', long, default_value = "40000")]
    target_port: u16,

    /// Seconds a repeat packet for the same MAC is suppressed
    #[arg(short, long, default_value = "30")]
    window: u64,

    /// Number of receive worker threads
    #[arg(short = 'r', long, default_value = "1")]
    receive_workers: usize,

    /// Liveness report interval in seconds
    #[arg(long, default_value = "30")]
    interval: u64,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = RelayConfig {
        listen_port: args.listen_port,
        broadcast_addr: args.broadcast,
        broadcast_port: args.target_port,
        dedup_window: Duration::from_secs(args.window),
        receive_workers: args.receive_workers,
    };

    info!("Starting WOL relay");
    let relay = Arc::new(WolRelay::new(config));
    let handle = relay.start()?;

    // Periodic liveness report and dedup cache sweep
    let stats_task = {
        let relay = relay.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(args.interval));
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;

                let swept = relay.cache().sweep_expired();
                if swept > 0 {
                    debug!("evicted {} stale dedup entries", swept);
                }

                let stats = relay.stats();
                debug!(
                    "running: received={} accepted={} duplicates={} malformed={} sent={} send_errors={} cache_entries={}",
                    stats.received.load(Ordering::Relaxed),
                    stats.accepted.load(Ordering::Relaxed),
                    stats.duplicates.load(Ordering::Relaxed),
                    stats.malformed.load(Ordering::Relaxed),
                    stats.sent.load(Ordering::Relaxed),
                    stats.send_errors.load(Ordering::Relaxed),
                    relay.cache().len(),
                );
                if let Some(last) = *stats.last_accept.lock() {
                    debug!("last acceptance {:.0?} ago", last.elapsed());
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received Ctrl+C, shutting down");

    relay.stop();
    stats_task.abort();
    handle.join();

    info!("WOL relay stopped");
    Ok(())
}
