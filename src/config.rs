use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::catalog::{StallCatalog, DEFAULT_STALLS};
use crate::listener::{ListenerConfig, DEFAULT_LISTEN_ADDR, DEFAULT_READ_TIMEOUT};
use crate::query::{QueryConfig, DEFAULT_QUERY_ADDR};
use crate::sink::{HttpSinkConfig, DEFAULT_SINK_TIMEOUT};
use crate::store::DEFAULT_STALE_AFTER_TICKS;
use crate::sweeper::DEFAULT_TICK_INTERVAL;

#[derive(Debug, Deserialize, Default)]
struct CollectorConfigFile {
    listen_addr: Option<String>,
    shared_secret: Option<String>,
    credentials_path: Option<PathBuf>,
    read_timeout_secs: Option<u64>,
    stalls: Option<Vec<String>>,
    query: Option<QueryConfigFile>,
    sink: Option<SinkConfigFile>,
    staleness: Option<StalenessConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryConfigFile {
    addr: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    url: Option<String>,
    auth_key: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StalenessConfigFile {
    threshold_ticks: Option<u64>,
    tick_millis: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub listen_addr: String,
    /// `None` disables the query API.
    pub query_addr: Option<String>,
    pub shared_secret: Zeroizing<String>,
    pub credentials_path: Option<PathBuf>,
    pub read_timeout: Duration,
    pub stalls: Vec<String>,
    pub sink: SinkSettings,
    pub stale_after_ticks: u64,
    pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// `None` disables downstream notification.
    pub url: Option<String>,
    pub auth_key: Option<String>,
    pub auth_token: Option<Zeroizing<String>>,
    pub timeout: Duration,
    pub retries: u32,
}

/// Secrets read from a `key=value` credentials file.
#[derive(Debug, Default)]
pub struct Credentials {
    pub password: Option<Zeroizing<String>>,
    pub auth_key: Option<String>,
    pub auth_token: Option<Zeroizing<String>>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            query_addr: Some(DEFAULT_QUERY_ADDR.to_string()),
            shared_secret: Zeroizing::new(String::new()),
            credentials_path: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            stalls: DEFAULT_STALLS.iter().map(|s| s.to_string()).collect(),
            sink: SinkSettings::default(),
            stale_after_ticks: DEFAULT_STALE_AFTER_TICKS,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            url: None,
            auth_key: None,
            auth_token: None,
            timeout: DEFAULT_SINK_TIMEOUT,
            retries: 0,
        }
    }
}

impl CollectorConfig {
    /// Load using the config file named by `QUEUE_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("QUEUE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an optional JSON file, apply `QUEUE_*` environment
    /// overrides, fill gaps from the credentials file, then validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.apply_credentials_file()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CollectorConfigFile) -> Self {
        let defaults = Self::default();
        let query_enabled = file
            .query
            .as_ref()
            .and_then(|query| query.enabled)
            .unwrap_or(true);
        let query_addr = file
            .query
            .and_then(|query| query.addr)
            .unwrap_or_else(|| DEFAULT_QUERY_ADDR.to_string());
        let sink = file.sink.unwrap_or_default();
        let staleness = file.staleness.unwrap_or_default();
        Self {
            listen_addr: file.listen_addr.unwrap_or(defaults.listen_addr),
            query_addr: query_enabled.then_some(query_addr),
            shared_secret: Zeroizing::new(file.shared_secret.unwrap_or_default()),
            credentials_path: file.credentials_path,
            read_timeout: file
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_timeout),
            stalls: file.stalls.unwrap_or(defaults.stalls),
            sink: SinkSettings {
                url: sink.url,
                auth_key: sink.auth_key,
                auth_token: sink.auth_token.map(Zeroizing::new),
                timeout: sink
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_SINK_TIMEOUT),
                retries: sink.retries.unwrap_or(0),
            },
            stale_after_ticks: staleness
                .threshold_ticks
                .unwrap_or(DEFAULT_STALE_AFTER_TICKS),
            tick_interval: staleness
                .tick_millis
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK_INTERVAL),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("QUEUE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        // Only moves an enabled API; `query.enabled: false` stays off.
        if let Some(addr) = non_empty_env("QUEUE_QUERY_ADDR") {
            if self.query_addr.is_some() {
                self.query_addr = Some(addr);
            }
        }
        if let Some(secret) = non_empty_env("QUEUE_SHARED_SECRET") {
            self.shared_secret = Zeroizing::new(secret);
        }
        if let Some(path) = non_empty_env("QUEUE_CREDENTIALS_PATH") {
            self.credentials_path = Some(PathBuf::from(path));
        }
        if let Some(url) = non_empty_env("QUEUE_SINK_URL") {
            self.sink.url = Some(url);
        }
        if let Some(key) = non_empty_env("QUEUE_AUTH_KEY") {
            self.sink.auth_key = Some(key);
        }
        if let Some(token) = non_empty_env("QUEUE_AUTH_TOKEN") {
            self.sink.auth_token = Some(Zeroizing::new(token));
        }
        if let Some(timeout) = non_empty_env("QUEUE_SINK_TIMEOUT_SECS") {
            let secs: u64 = timeout.parse().map_err(|_| {
                anyhow!("QUEUE_SINK_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.sink.timeout = Duration::from_secs(secs);
        }
        if let Some(ticks) = non_empty_env("QUEUE_STALE_AFTER_TICKS") {
            self.stale_after_ticks = ticks
                .parse()
                .map_err(|_| anyhow!("QUEUE_STALE_AFTER_TICKS must be an integer"))?;
        }
        if let Some(millis) = non_empty_env("QUEUE_TICK_MILLIS") {
            let millis: u64 = millis
                .parse()
                .map_err(|_| anyhow!("QUEUE_TICK_MILLIS must be an integer number of milliseconds"))?;
            self.tick_interval = Duration::from_millis(millis);
        }
        if let Some(stalls) = non_empty_env("QUEUE_STALLS") {
            let parsed = split_csv(&stalls);
            if !parsed.is_empty() {
                self.stalls = parsed;
            }
        }
        Ok(())
    }

    fn apply_credentials_file(&mut self) -> Result<()> {
        let Some(path) = self.credentials_path.clone() else {
            return Ok(());
        };
        let creds = read_credentials_file(&path)?;
        if self.shared_secret.is_empty() {
            if let Some(password) = creds.password {
                self.shared_secret = password;
            }
        }
        if self.sink.auth_key.is_none() {
            self.sink.auth_key = creds.auth_key;
        }
        if self.sink.auth_token.is_none() {
            self.sink.auth_token = creds.auth_token;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.shared_secret.trim().is_empty() {
            return Err(anyhow!(
                "shared secret is required (QUEUE_SHARED_SECRET, shared_secret, or password= in the credentials file)"
            ));
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address '{}'", self.listen_addr))?;
        if let Some(addr) = &self.query_addr {
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid query address '{}'", addr))?;
        }
        self.catalog()?;

        if self.stale_after_ticks == 0 {
            return Err(anyhow!("staleness threshold must be greater than zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick interval must be greater than zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(anyhow!("read timeout must be greater than zero"));
        }

        if let Some(url) = &self.sink.url {
            crate::sink::update_endpoint(url)?;
            let has_key = self
                .sink
                .auth_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty());
            let has_token = self
                .sink
                .auth_token
                .as_ref()
                .is_some_and(|token| !token.is_empty());
            if !has_key || !has_token {
                return Err(anyhow!(
                    "sink auth_key and auth_token are required when a sink url is set"
                ));
            }
            if self.sink.timeout.is_zero() {
                return Err(anyhow!("sink timeout must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> Result<StallCatalog> {
        StallCatalog::new(&self.stalls)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            addr: self.listen_addr.clone(),
            shared_secret: self.shared_secret.clone(),
            read_timeout: self.read_timeout,
        }
    }

    pub fn query_config(&self) -> Option<QueryConfig> {
        self.query_addr
            .as_ref()
            .map(|addr| QueryConfig { addr: addr.clone() })
    }

    /// HTTP sink settings, or `None` when no sink URL is configured.
    pub fn http_sink_config(&self) -> Result<Option<HttpSinkConfig>> {
        let Some(url) = &self.sink.url else {
            return Ok(None);
        };
        let auth_key = self
            .sink
            .auth_key
            .clone()
            .ok_or_else(|| anyhow!("sink auth_key is required when a sink url is set"))?;
        let auth_token = self
            .sink
            .auth_token
            .clone()
            .ok_or_else(|| anyhow!("sink auth_token is required when a sink url is set"))?;
        Ok(Some(HttpSinkConfig {
            base_url: url.clone(),
            auth_key,
            auth_token,
            timeout: self.sink.timeout,
            retries: self.sink.retries,
        }))
    }
}

/// Read a `key=value` credentials file (`password`, `auth_key`,
/// `auth_token`). Blank lines and `#` comments are skipped; other keys are
/// ignored.
pub fn read_credentials_file(path: &Path) -> Result<Credentials> {
    let raw = Zeroizing::new(
        std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read credentials file {}: {}", path.display(), e))?,
    );
    let mut creds = Credentials::default();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            anyhow!(
                "credentials file {} line {}: expected key=value",
                path.display(),
                line_no + 1
            )
        })?;
        let value = value.to_string();
        match key.trim() {
            "password" => creds.password = Some(Zeroizing::new(value)),
            "auth_key" => creds.auth_key = Some(value),
            "auth_token" => creds.auth_token = Some(Zeroizing::new(value)),
            _ => {}
        }
    }
    Ok(creds)
}

fn read_config_file(path: &Path) -> Result<CollectorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
