//! Canteen queue collector
//!
//! Sensor nodes (a camera on a single-board computer per group of stalls)
//! count people in each queue and periodically report an estimated wait
//! time to this collector over TCP. The collector keeps the latest value
//! per stall, forgets values that have not been refreshed recently, and
//! exposes the result to downstream consumers.
//!
//! # Architecture
//!
//! - `catalog`: the fixed set of stalls (`StallCatalog`, `SourceId`)
//! - `store`: latest value and age per stall (`AggregateStore`)
//! - `sweeper`: background ageing and expiry of stale values
//! - `protocol`: the `secret|stall|value` wire format and `ACK`
//! - `listener`: TCP accept loop, one thread per report connection
//! - `sink`: best-effort downstream notification (`HttpSink`)
//! - `query`: read-only HTTP API over the store
//! - `client`, `wait_time`: the sensor-node side of the protocol
//!
//! The store is the only shared mutable state. The listener is its only
//! writer of fresh values and the sweeper its only writer of expiry.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;

pub mod catalog;
pub mod client;
pub mod config;
pub mod listener;
pub mod protocol;
pub mod query;
pub mod sink;
pub mod store;
pub mod sweeper;
pub mod wait_time;

pub use catalog::{SourceId, StallCatalog, DEFAULT_STALLS};
pub use client::send_report;
pub use config::CollectorConfig;
pub use listener::{ListenerConfig, ListenerHandle, ReportListener};
pub use protocol::{Rejection, Report, ACK, MAX_REPORT_BYTES};
pub use query::{QueryConfig, QueryHandle, QueryServer};
pub use sink::{HttpSink, HttpSinkConfig, NullSink, UpdateSink};
pub use store::{AggregateEntry, AggregateStore, Snapshot, UNSET_SENTINEL};
pub use sweeper::{Sweeper, SweeperHandle};

/// Everything the collector runs, built from one [`CollectorConfig`].
pub struct Collector {
    config: CollectorConfig,
    sink: Arc<dyn UpdateSink>,
}

impl Collector {
    /// Build a collector whose sink follows the configuration: an
    /// [`HttpSink`] when a sink URL is set, otherwise a [`NullSink`].
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let sink: Arc<dyn UpdateSink> = match config.http_sink_config()? {
            Some(sink_cfg) => Arc::new(HttpSink::new(sink_cfg)?),
            None => Arc::new(NullSink),
        };
        Ok(Self { config, sink })
    }

    pub fn with_sink(config: CollectorConfig, sink: Arc<dyn UpdateSink>) -> Self {
        Self { config, sink }
    }

    /// Bind the report listener and query API and start the sweeper.
    ///
    /// Fails if either socket cannot be bound; anything already started is
    /// stopped again before returning.
    pub fn start(self) -> Result<CollectorHandle> {
        let store = AggregateStore::new(self.config.catalog()?, self.config.stale_after_ticks)?;

        let listener = ReportListener::new(
            self.config.listener_config(),
            store.clone(),
            self.sink.clone(),
        )
        .spawn()?;

        let query = match self.config.query_config() {
            Some(query_cfg) => match QueryServer::new(query_cfg, store.clone()).spawn() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    let _ = listener.stop();
                    return Err(err);
                }
            },
            None => None,
        };

        let sweeper = match Sweeper::new(store.clone(), self.config.tick_interval).spawn() {
            Ok(handle) => handle,
            Err(err) => {
                let _ = listener.stop();
                if let Some(query) = query {
                    let _ = query.stop();
                }
                return Err(err);
            }
        };

        Ok(CollectorHandle {
            report_addr: listener.addr,
            query_addr: query.as_ref().map(|query| query.addr),
            store,
            listener,
            query,
            sweeper,
        })
    }
}

pub struct CollectorHandle {
    pub report_addr: SocketAddr,
    pub query_addr: Option<SocketAddr>,
    store: AggregateStore,
    listener: ListenerHandle,
    query: Option<QueryHandle>,
    sweeper: SweeperHandle,
}

impl CollectorHandle {
    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// False once any background thread has exited on its own.
    pub fn is_healthy(&self) -> bool {
        self.listener.is_running()
            && self.sweeper.is_running()
            && self.query.as_ref().map_or(true, QueryHandle::is_running)
    }

    /// Stop accepting reports (draining in-flight connections), then stop
    /// the sweeper and query API. Returns the first error encountered.
    pub fn stop(self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(err) = self.listener.stop() {
            errors.push(err);
        }
        if let Err(err) = self.sweeper.stop() {
            errors.push(err);
        }
        if let Some(query) = self.query {
            if let Err(err) = query.stop() {
                errors.push(err);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => Err(anyhow!(
                "{} collector components failed to stop cleanly; first: {:#}",
                n,
                errors.remove(0)
            )),
        }
    }
}
