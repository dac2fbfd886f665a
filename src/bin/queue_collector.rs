//! queue_collector - canteen queue wait-time collector daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file, QUEUE_* environment, credentials file)
//! 2. Accepts `secret|stall|value` reports from sensor nodes
//! 3. Forwards accepted reports to the dashboard sink, if configured
//! 4. Expires values that have not been refreshed
//! 5. Serves the current values on the loopback query API

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use canteen_queue::{Collector, CollectorConfig};

const HEALTH_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Collect stall queue wait times reported by sensor nodes"
)]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "QUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// Turn on debug logging (overridden by RUST_LOG).
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = CollectorConfig::load_from(args.config.as_deref())?;
    let catalog = config.catalog()?;
    match &config.sink.url {
        Some(url) => log::info!("forwarding accepted reports to {}", url),
        None => log::warn!("no sink url configured; accepted reports stay local"),
    }

    let handle = Collector::new(config.clone())?.start()?;
    log::info!("report listener on {}", handle.report_addr);
    if let Some(addr) = handle.query_addr {
        log::info!("query api on http://{}", addr);
    }
    log::info!(
        "tracking {} stalls; values expire after {} ticks of {:?}",
        catalog.len(),
        config.stale_after_ticks,
        config.tick_interval
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("queue_collector waiting for shutdown signal (Ctrl-C)...");
    let mut failed = false;
    loop {
        match rx.recv_timeout(HEALTH_POLL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping collector...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !handle.is_healthy() {
                    log::error!("collector component stopped unexpectedly; shutting down");
                    failed = true;
                    break;
                }
            }
        }
    }

    handle.stop()?;
    if failed {
        return Err(anyhow!("collector stopped after an internal failure"));
    }
    Ok(())
}
