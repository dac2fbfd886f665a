//! Staleness sweeper.
//!
//! Ticks the aggregate store once per interval for the life of the process.
//! The sweeper is the only thing that clears values; a tick failure means
//! the store is unusable, so the loop ends and reports the error.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::store::AggregateStore;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Sweeper {
    store: AggregateStore,
    interval: Duration,
}

#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<Result<()>>>,
}

impl Sweeper {
    pub fn new(store: AggregateStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn spawn(self) -> Result<SweeperHandle> {
        if self.interval.is_zero() {
            return Err(anyhow!("sweeper tick interval must be greater than zero"));
        }
        let (stop_tx, stop_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("staleness-sweeper".to_string())
            .spawn(move || run_sweeper(self.store, self.interval, stop_rx))
            .context("spawn staleness sweeper thread")?;
        Ok(SweeperHandle {
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Stop ticking. Returns the error that ended the loop early, if any.
    pub fn stop(mut self) -> Result<()> {
        self.stop_tx.take();
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("staleness sweeper thread panicked"))?,
            None => Ok(()),
        }
    }
}

fn run_sweeper(store: AggregateStore, interval: Duration, stop_rx: mpsc::Receiver<()>) -> Result<()> {
    log::debug!(
        "staleness sweeper running: interval={:?} stale_after={} ticks",
        interval,
        store.stale_after()
    );
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
        let expired = match store.tick() {
            Ok(expired) => expired,
            Err(err) => {
                log::error!("staleness sweep failed: {:#}", err);
                return Err(err);
            }
        };
        for source in expired {
            log::info!(
                "stall {} went stale after {} ticks without a report",
                source,
                store.stale_after()
            );
        }
    }
}
