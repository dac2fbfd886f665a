//! queue_report - send one wait-time report to the collector.
//!
//! Used by sensor nodes (or by hand) to push a value for a stall. The value
//! is either given literally or estimated from a people count.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use canteen_queue::config::read_credentials_file;
use canteen_queue::{send_report, wait_time, Report};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send a stall wait-time report to the collector")]
struct Args {
    /// Collector report address.
    #[arg(long, env = "QUEUE_COLLECTOR_ADDR", default_value = "127.0.0.1:6942")]
    addr: String,

    /// Shared secret (overrides the credentials file).
    #[arg(long, env = "QUEUE_SHARED_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Path to a key=value credentials file containing password=...
    #[arg(long, env = "QUEUE_CREDENTIALS_PATH")]
    credentials_path: Option<PathBuf>,

    /// Stall name, exactly as listed in the collector's catalog.
    #[arg(long)]
    stall: String,

    /// Literal value to report, e.g. "~3".
    #[arg(long, conflicts_with = "people")]
    value: Option<String>,

    /// People counted in the queue.
    #[arg(long, requires = "secs_per_person")]
    people: Option<u32>,

    /// Seconds each person takes to be served at this stall.
    #[arg(long)]
    secs_per_person: Option<u32>,

    /// Connect/read timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let secret = resolve_secret(&args)?;
    let value = match (&args.value, args.people, args.secs_per_person) {
        (Some(value), _, _) => value.clone(),
        (None, Some(people), Some(secs)) => wait_time::estimate(people, secs),
        _ => return Err(anyhow!("either --value or --people with --secs-per-person is required")),
    };

    let report = Report::new(&secret, &args.stall, &value)?;
    send_report(&args.addr, &report, Duration::from_secs(args.timeout_secs))?;
    log::info!("reported {} = {} to {}", args.stall, value, args.addr);
    Ok(())
}

fn resolve_secret(args: &Args) -> Result<zeroize::Zeroizing<String>> {
    if let Some(secret) = &args.secret {
        if !secret.trim().is_empty() {
            return Ok(zeroize::Zeroizing::new(secret.clone()));
        }
    }
    let path = args
        .credentials_path
        .as_ref()
        .ok_or_else(|| anyhow!("--secret or --credentials-path is required"))?;
    read_credentials_file(path)?
        .password
        .ok_or_else(|| anyhow!("password not found in {}", path.display()))
}
