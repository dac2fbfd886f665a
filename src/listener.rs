//! Report listener.
//!
//! Accepts sensor connections and runs each one on its own thread, so a slow
//! or silent node never holds up the accept loop. Per connection the
//! sequence is: one bounded read, parse, validate, apply to the store,
//! notify the sink, write `ACK`, close.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::protocol::{Rejection, Report, ACK, MAX_REPORT_BYTES};
use crate::sink::UpdateSink;
use crate::store::AggregateStore;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6942";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub addr: String,
    pub shared_secret: Zeroizing<String>,
    /// Upper bound on waiting for a connected node to send its report.
    pub read_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN_ADDR.to_string(),
            shared_secret: Zeroizing::new(String::new()),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct ListenerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting and wait for in-flight connections to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("report listener thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ReportListener {
    cfg: ListenerConfig,
    store: AggregateStore,
    sink: Arc<dyn UpdateSink>,
}

struct ConnectionContext {
    shared_secret: Zeroizing<String>,
    read_timeout: Duration,
    store: AggregateStore,
    sink: Arc<dyn UpdateSink>,
}

impl ReportListener {
    pub fn new(cfg: ListenerConfig, store: AggregateStore, sink: Arc<dyn UpdateSink>) -> Self {
        Self { cfg, store, sink }
    }

    /// Bind and start the accept loop. A bind failure is returned to the
    /// caller; nothing after that point fails the listener as a whole.
    pub fn spawn(self) -> Result<ListenerHandle> {
        if self.cfg.shared_secret.is_empty() {
            return Err(anyhow!("report listener requires a shared secret"));
        }
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse report listener address {}", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind report listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let ctx = Arc::new(ConnectionContext {
            shared_secret: self.cfg.shared_secret,
            read_timeout: self.cfg.read_timeout,
            store: self.store,
            sink: self.sink,
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("report-accept".to_string())
            .spawn(move || run_accept_loop(listener, ctx, shutdown_thread))
            .context("spawn report accept thread")?;

        Ok(ListenerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>, shutdown: Arc<AtomicBool>) {
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("accepted report connection from {}", peer);
                in_flight.retain(|handle| !handle.is_finished());
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("report-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &ctx) {
                            log::warn!("report connection from {} dropped: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => in_flight.push(handle),
                    Err(err) => log::error!("failed to spawn report connection thread: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("report accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }

    in_flight.retain(|handle| !handle.is_finished());
    if !in_flight.is_empty() {
        log::info!(
            "report listener stopping; draining {} in-flight connection(s)",
            in_flight.len()
        );
    }
    for handle in in_flight {
        if handle.join().is_err() {
            log::error!("report connection thread panicked");
        }
    }
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(ctx.read_timeout))?;

    let mut buf = [0u8; MAX_REPORT_BYTES];
    let n = stream.read(&mut buf).context("read report")?;

    match Report::parse(&buf[..n]) {
        Err(Rejection::NotUtf8) => return Err(Rejection::NotUtf8.into()),
        Err(rejection) => log::warn!("invalid report from {}: {}", peer, rejection),
        Ok(report) => apply_report(&report, peer, ctx)?,
    }

    stream.write_all(ACK).context("send ack")?;
    Ok(())
}

fn apply_report(report: &Report, peer: SocketAddr, ctx: &ConnectionContext) -> Result<()> {
    let source = match report.validate(&ctx.shared_secret, ctx.store.catalog()) {
        Ok(source) => source.clone(),
        Err(rejection) => {
            log::warn!("invalid report from {}: {}", peer, rejection);
            return Ok(());
        }
    };

    ctx.store.set(&source, report.value.as_str())?;
    log::info!("stall {} updated to {:?} by {}", source, report.value, peer);

    if let Err(err) = ctx.sink.notify(&source, &report.value) {
        log::warn!("sink update for {} failed: {:#}", source, err);
    }
    Ok(())
}
