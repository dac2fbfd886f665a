//! Downstream notification of accepted reports.
//!
//! After a report is applied locally, the listener forwards it to a sink
//! (normally the dashboard web service). Delivery is best-effort: the local
//! store stays authoritative and a failed notification never changes what
//! the sensor node is told.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

use crate::catalog::SourceId;

pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);

const UPDATE_PATH: &str = "api/update_timing";
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Receiver of accepted `(stall, value)` updates.
pub trait UpdateSink: Send + Sync {
    fn notify(&self, source: &SourceId, value: &str) -> Result<()>;
}

/// Sink used when no downstream service is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl UpdateSink for NullSink {
    fn notify(&self, _source: &SourceId, _value: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HttpSinkConfig {
    /// Base URL of the dashboard service, e.g. `http://localhost`.
    pub base_url: String,
    /// Header name carrying the credential.
    pub auth_key: String,
    pub auth_token: Zeroizing<String>,
    pub timeout: Duration,
    /// Extra attempts after the first failure. Zero means fire once.
    pub retries: u32,
}

/// Posts each update to `{base}/api/update_timing` with the credential
/// header. Only a `200` response counts as delivered.
pub struct HttpSink {
    agent: ureq::Agent,
    endpoint: Url,
    auth_key: String,
    auth_token: Zeroizing<String>,
    retries: u32,
}

impl HttpSink {
    pub fn new(cfg: HttpSinkConfig) -> Result<Self> {
        let endpoint = update_endpoint(&cfg.base_url)?;
        if cfg.auth_key.trim().is_empty() {
            return Err(anyhow!("sink auth key must not be empty"));
        }
        let agent = ureq::AgentBuilder::new().timeout(cfg.timeout).build();
        Ok(Self {
            agent,
            endpoint,
            auth_key: cfg.auth_key,
            auth_token: cfg.auth_token,
            retries: cfg.retries,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn post_once(&self, source: &SourceId, value: &str) -> Result<()> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("stall_name", source.as_str())
            .append_pair("queue_time", value);
        let response = self
            .agent
            .request_url("POST", &url)
            .set(&self.auth_key, self.auth_token.as_str())
            .call();
        match response {
            Ok(response) if response.status() == 200 => Ok(()),
            Ok(response) => Err(anyhow!("sink returned status {}", response.status())),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!("sink returned status {}: {}", code, body.trim()))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("sink unreachable: {}", err)),
        }
    }
}

impl UpdateSink for HttpSink {
    fn notify(&self, source: &SourceId, value: &str) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.post_once(source, value) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "sink update for {} failed (attempt {}/{}): {}",
                        source,
                        attempt,
                        self.retries + 1,
                        err
                    );
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) fn update_endpoint(base_url: &str) -> Result<Url> {
    let base = Url::parse(base_url).with_context(|| format!("parse sink url {}", base_url))?;
    match base.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported sink scheme '{}'; expected http(s)",
                other
            ))
        }
    }
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), UPDATE_PATH);
    Url::parse(&joined).with_context(|| format!("build sink endpoint from {}", base_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StallCatalog;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::mpsc;

    /// Serve one canned status per accepted connection and hand back each
    /// raw request head.
    fn stub_server(statuses: Vec<u16>) -> (SocketAddr, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for status in statuses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let mut data = Vec::new();
                while !data.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                }
                tx.send(String::from_utf8_lossy(&data).to_string()).unwrap();
                let body = "done";
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        (addr, rx)
    }

    /// Accept one connection, read the request, then never answer.
    fn silent_server(hold: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                std::thread::sleep(hold);
            }
        });
        addr
    }

    fn sink_with_timeout(addr: SocketAddr, retries: u32, timeout: Duration) -> HttpSink {
        HttpSink::new(HttpSinkConfig {
            base_url: format!("http://{addr}"),
            auth_key: "X-Queue-Key".to_string(),
            auth_token: Zeroizing::new("token-123".to_string()),
            timeout,
            retries,
        })
        .unwrap()
    }

    fn sink_for(addr: SocketAddr, retries: u32) -> HttpSink {
        sink_with_timeout(addr, retries, Duration::from_secs(2))
    }

    fn malay() -> SourceId {
        StallCatalog::default().lookup("Malay 1").unwrap().clone()
    }

    #[test]
    fn posts_update_with_credential_header() {
        let (addr, requests) = stub_server(vec![200]);
        let sink = sink_for(addr, 0);
        assert_eq!(
            sink.endpoint().as_str(),
            format!("http://{addr}/api/update_timing")
        );
        sink.notify(&malay(), "~3").unwrap();

        let request = requests.recv().unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("POST /api/update_timing?"));
        assert!(request_line.contains("stall_name=Malay+1"));
        assert!(request_line.contains("queue_time=%7E3") || request_line.contains("queue_time=~3"));
        assert!(request
            .to_lowercase()
            .contains("x-queue-key: token-123"));
    }

    #[test]
    fn non_success_status_is_an_error() {
        let (addr, _requests) = stub_server(vec![400]);
        let sink = sink_for(addr, 0);
        let err = sink.notify(&malay(), "5").unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn unreachable_sink_is_an_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let sink = sink_for(addr, 0);
        assert!(sink.notify(&malay(), "5").is_err());
    }

    #[test]
    fn unresponsive_sink_times_out() {
        let addr = silent_server(Duration::from_secs(10));
        let sink = sink_with_timeout(addr, 0, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = sink.notify(&malay(), "~2").unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("sink unreachable"));
    }

    #[test]
    fn retries_until_success() {
        let (addr, requests) = stub_server(vec![503, 200]);
        let sink = sink_for(addr, 1);
        sink.notify(&malay(), "5").unwrap();
        assert_eq!(requests.iter().take(2).count(), 2);
    }

    #[test]
    fn endpoint_joins_base_path() {
        assert_eq!(
            update_endpoint("http://localhost").unwrap().as_str(),
            "http://localhost/api/update_timing"
        );
        assert_eq!(
            update_endpoint("https://example.com/queue/").unwrap().as_str(),
            "https://example.com/queue/api/update_timing"
        );
        assert!(update_endpoint("ftp://example.com").is_err());
        assert!(update_endpoint("not a url").is_err());
    }
}
