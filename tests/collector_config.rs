use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use canteen_queue::config::{read_credentials_file, CollectorConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "QUEUE_CONFIG",
        "QUEUE_LISTEN_ADDR",
        "QUEUE_QUERY_ADDR",
        "QUEUE_SHARED_SECRET",
        "QUEUE_CREDENTIALS_PATH",
        "QUEUE_SINK_URL",
        "QUEUE_AUTH_KEY",
        "QUEUE_AUTH_TOKEN",
        "QUEUE_SINK_TIMEOUT_SECS",
        "QUEUE_STALE_AFTER_TICKS",
        "QUEUE_TICK_MILLIS",
        "QUEUE_STALLS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        r#"{
            "listen_addr": "0.0.0.0:7000",
            "shared_secret": "from-file",
            "read_timeout_secs": 3,
            "stalls": ["Drinks", "Snacks"],
            "query": { "addr": "127.0.0.1:9000" },
            "sink": {
                "url": "http://dashboard.local",
                "auth_key": "X-Queue-Key",
                "auth_token": "tok",
                "timeout_secs": 2,
                "retries": 1
            },
            "staleness": { "threshold_ticks": 30, "tick_millis": 500 }
        }"#,
    );

    std::env::set_var("QUEUE_CONFIG", file.path());
    std::env::set_var("QUEUE_SHARED_SECRET", "from-env");
    std::env::set_var("QUEUE_STALE_AFTER_TICKS", "90");

    let cfg = CollectorConfig::load().expect("load config");

    assert_eq!(cfg.listen_addr, "0.0.0.0:7000");
    assert_eq!(cfg.query_addr.as_deref(), Some("127.0.0.1:9000"));
    assert_eq!(cfg.shared_secret.as_str(), "from-env");
    assert_eq!(cfg.read_timeout, Duration::from_secs(3));
    assert_eq!(cfg.stalls, vec!["Drinks", "Snacks"]);
    assert_eq!(cfg.stale_after_ticks, 90);
    assert_eq!(cfg.tick_interval, Duration::from_millis(500));

    let sink = cfg.http_sink_config().unwrap().expect("sink configured");
    assert_eq!(sink.base_url, "http://dashboard.local");
    assert_eq!(sink.auth_key, "X-Queue-Key");
    assert_eq!(sink.auth_token.as_str(), "tok");
    assert_eq!(sink.timeout, Duration::from_secs(2));
    assert_eq!(sink.retries, 1);

    clear_env();
}

#[test]
fn defaults_apply_when_only_secret_is_set() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("QUEUE_SHARED_SECRET", "s3cret");

    let cfg = CollectorConfig::load().expect("load config");
    assert_eq!(cfg.listen_addr, "0.0.0.0:6942");
    assert_eq!(cfg.query_addr.as_deref(), Some("127.0.0.1:8080"));
    assert_eq!(cfg.stale_after_ticks, 60);
    assert_eq!(cfg.tick_interval, Duration::from_secs(1));
    assert_eq!(cfg.catalog().unwrap().len(), 8);
    assert!(cfg.http_sink_config().unwrap().is_none());

    clear_env();
}

#[test]
fn missing_secret_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = CollectorConfig::load().unwrap_err();
    assert!(err.to_string().contains("shared secret is required"));

    clear_env();
}

#[test]
fn sink_url_without_credentials_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("QUEUE_SHARED_SECRET", "s3cret");
    std::env::set_var("QUEUE_SINK_URL", "http://localhost");

    let err = CollectorConfig::load().unwrap_err();
    assert!(err.to_string().contains("auth_key and auth_token are required"));

    clear_env();
}

#[test]
fn credentials_file_fills_missing_secrets() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let creds = write_temp("password=YW1vZ3Vz\nauth_key=X-Queue-Key\nauth_token=tok=with=equals\n");
    std::env::set_var("QUEUE_CREDENTIALS_PATH", creds.path());
    std::env::set_var("QUEUE_SINK_URL", "http://localhost");
    std::env::set_var("QUEUE_AUTH_KEY", "X-Env-Key");

    let cfg = CollectorConfig::load().expect("load config");
    assert_eq!(cfg.shared_secret.as_str(), "YW1vZ3Vz");
    let sink = cfg.http_sink_config().unwrap().expect("sink configured");
    assert_eq!(sink.auth_key, "X-Env-Key");
    assert_eq!(sink.auth_token.as_str(), "tok=with=equals");

    clear_env();
}

#[test]
fn stalls_from_env_are_validated() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("QUEUE_SHARED_SECRET", "s3cret");

    std::env::set_var("QUEUE_STALLS", "Drinks, Snacks ,Western");
    let cfg = CollectorConfig::load().expect("load config");
    assert_eq!(cfg.stalls, vec!["Drinks", "Snacks", "Western"]);

    std::env::set_var("QUEUE_STALLS", "Drinks,Drinks");
    assert!(CollectorConfig::load().is_err());

    std::env::set_var("QUEUE_STALLS", "Drinks|Snacks");
    assert!(CollectorConfig::load().is_err());

    clear_env();
}

#[test]
fn invalid_numbers_and_zero_intervals_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("QUEUE_SHARED_SECRET", "s3cret");

    std::env::set_var("QUEUE_TICK_MILLIS", "soon");
    assert!(CollectorConfig::load().is_err());

    std::env::set_var("QUEUE_TICK_MILLIS", "0");
    assert!(CollectorConfig::load().is_err());

    std::env::remove_var("QUEUE_TICK_MILLIS");
    std::env::set_var("QUEUE_STALE_AFTER_TICKS", "0");
    assert!(CollectorConfig::load().is_err());

    clear_env();
}

#[test]
fn query_api_can_be_disabled() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(r#"{ "shared_secret": "s3cret", "query": { "enabled": false } }"#);
    let cfg = CollectorConfig::load_from(Some(file.path())).expect("load config");
    assert!(cfg.query_addr.is_none());
    assert!(cfg.query_config().is_none());

    std::env::set_var("QUEUE_QUERY_ADDR", "127.0.0.1:9100");
    let cfg = CollectorConfig::load_from(Some(file.path())).expect("load config");
    assert!(cfg.query_addr.is_none());

    clear_env();
}

#[test]
fn credentials_file_rejects_malformed_lines() {
    let file = write_temp("# comment\n\npassword=abc\nnot a pair\n");
    let err = read_credentials_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("line 4"));

    let file = write_temp("password=abc\r\nother=ignored\n");
    let creds = read_credentials_file(file.path()).unwrap();
    assert_eq!(creds.password.as_deref().map(String::as_str), Some("abc"));
    assert!(creds.auth_key.is_none());
}
