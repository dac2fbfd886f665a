//! Read-only HTTP query API over the aggregate store.
//!
//! Serves the two queries downstream consumers need:
//!
//! - `GET /api/get_timing?stall_name=<name>`: current value as text, or
//!   `???` when the stall is stale or has never reported.
//! - `GET /api/get_timing?stall_name=all`: every stall as JSON.
//!
//! plus `GET /health`. Requests are handled inline on the accept thread.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::store::AggregateStore;

pub const DEFAULT_QUERY_ADDR: &str = "127.0.0.1:8080";

const MAX_REQUEST_BYTES: usize = 8192;
const ALL_STALLS: &str = "all";
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct QueryConfig {
    pub addr: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_QUERY_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct QueryHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl QueryHandle {
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("query api thread panicked"))?;
        }
        Ok(())
    }
}

pub struct QueryServer {
    cfg: QueryConfig,
    store: AggregateStore,
}

impl QueryServer {
    pub fn new(cfg: QueryConfig, store: AggregateStore) -> Self {
        Self { cfg, store }
    }

    pub fn spawn(self) -> Result<QueryHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse query api address {}", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind query api on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "query api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let store = self.store;
        let join = std::thread::Builder::new()
            .name("query-api".to_string())
            .spawn(move || run_query_api(listener, store, shutdown_thread))
            .context("spawn query api thread")?;

        Ok(QueryHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_query_api(listener: TcpListener, store: AggregateStore, shutdown: Arc<AtomicBool>) {
    serve_requests(|| listener.accept().map(|(stream, _)| stream), &store, &shutdown);
}

/// Accept errors are logged and retried; only shutdown ends the loop.
fn serve_requests<A>(mut accept: A, store: &AggregateStore, shutdown: &AtomicBool)
where
    A: FnMut() -> std::io::Result<TcpStream>,
{
    while !shutdown.load(Ordering::SeqCst) {
        match accept() {
            Ok(stream) => {
                if let Err(err) = handle_connection(stream, store) {
                    log::warn!("query api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("query api accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, store: &AggregateStore) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_text_response(&mut stream, 403, "Forbidden")?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_text_response(&mut stream, 405, "Method not allowed")?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => {
            write_response(&mut stream, 200, "application/json", br#"{"status":"ok"}"#)?;
            Ok(())
        }
        "/api/get_timing" => get_timing(&mut stream, store, &request),
        _ => {
            write_text_response(&mut stream, 404, "Not found")?;
            Ok(())
        }
    }
}

fn get_timing(stream: &mut TcpStream, store: &AggregateStore, request: &HttpRequest) -> Result<()> {
    let Some(stall) = request.query_param("stall_name") else {
        write_text_response(stream, 400, "Missing stall name")?;
        return Ok(());
    };

    if stall == ALL_STALLS {
        let snapshot = store.snapshot()?;
        let mut body = Map::new();
        for entry in snapshot.iter() {
            body.insert(
                entry.source.to_string(),
                json!({ "value": entry.value, "age_secs": entry.age_secs }),
            );
        }
        let payload = serde_json::to_vec(&Value::Object(body))?;
        return write_response(stream, 200, "application/json", &payload);
    }

    match store.get(stall)? {
        Some(entry) => write_text_response(stream, 200, entry.display_value()),
        None => write_text_response(stream, 400, "Invalid stall name"),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_text_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "text/plain; charset=utf-8", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
