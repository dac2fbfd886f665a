//! Sensor-side sender for reports.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::{Report, ACK};

/// Send one report to the collector at `addr` and wait for its `ACK`.
///
/// An `ACK` only means the collector read the report; it is sent for
/// refused reports too.
pub fn send_report(addr: &str, report: &Report, timeout: Duration) -> Result<()> {
    let target = addr
        .to_socket_addrs()
        .with_context(|| format!("resolve collector address {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("collector address {} resolved to nothing", addr))?;
    let mut stream = TcpStream::connect_timeout(&target, timeout)
        .with_context(|| format!("connect to collector at {}", target))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream
        .write_all(report.encode().as_bytes())
        .context("send report")?;

    let mut reply = Vec::new();
    (&mut stream)
        .take(64)
        .read_to_end(&mut reply)
        .context("read collector reply")?;
    if reply != ACK {
        return Err(anyhow!(
            "collector replied {:?} instead of ACK",
            String::from_utf8_lossy(&reply)
        ));
    }
    Ok(())
}
