//! Sensor report wire format.
//!
//! A sensor node opens a TCP connection, writes one plaintext report
//!
//! ```text
//! <shared secret>|<stall name>|<value>
//! ```
//!
//! and waits for the literal bytes `ACK`. There is no length prefix: the
//! collector performs a single read of at most [`MAX_REPORT_BYTES`] and
//! treats whatever arrived as the whole report. A report split across TCP
//! segments is therefore seen truncated. The collector sends
//! `ACK` whether or not the report was accepted, so a node cannot tell a
//! refused report from an accepted one.

use anyhow::{anyhow, Result};
use std::fmt;
use zeroize::Zeroizing;

use crate::catalog::{SourceId, StallCatalog};

/// Acknowledgement written back on every parseable connection.
pub const ACK: &[u8] = b"ACK";

/// Size of the single read that must contain the whole report.
pub const MAX_REPORT_BYTES: usize = 1024;

pub const FIELD_DELIMITER: char = '|';

const FIELD_COUNT: usize = 3;

/// One report as received, before it is checked against the secret and
/// catalog.
#[derive(Clone, PartialEq, Eq)]
pub struct Report {
    secret: Zeroizing<String>,
    pub stall: String,
    /// Opaque formatted wait time, e.g. `~3`, or `0.9` for under a minute.
    pub value: String,
}

impl Report {
    /// Build an outgoing report. Fields may not contain the delimiter.
    pub fn new(secret: &str, stall: &str, value: &str) -> Result<Self> {
        for (name, field) in [("secret", secret), ("stall", stall), ("value", value)] {
            if field.contains(FIELD_DELIMITER) {
                return Err(anyhow!(
                    "report {} may not contain '{}'",
                    name,
                    FIELD_DELIMITER
                ));
            }
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_string()),
            stall: stall.to_string(),
            value: value.to_string(),
        })
    }

    /// Split a received payload into its three fields.
    pub fn parse(payload: &[u8]) -> Result<Self, Rejection> {
        let text = std::str::from_utf8(payload).map_err(|_| Rejection::NotUtf8)?;
        let fields: Vec<&str> = text.split(FIELD_DELIMITER).collect();
        if fields.len() != FIELD_COUNT {
            return Err(Rejection::FieldCount(fields.len()));
        }
        Ok(Self {
            secret: Zeroizing::new(fields[0].to_string()),
            stall: fields[1].to_string(),
            value: fields[2].to_string(),
        })
    }

    /// Check the presented secret and stall. On success returns the
    /// catalog's id for the stall.
    pub fn validate<'a>(
        &self,
        expected_secret: &str,
        catalog: &'a StallCatalog,
    ) -> Result<&'a SourceId, Rejection> {
        if self.secret.as_str() != expected_secret {
            return Err(Rejection::BadSecret);
        }
        catalog
            .lookup(&self.stall)
            .ok_or_else(|| Rejection::UnknownSource(self.stall.clone()))
    }

    /// Wire form of the report.
    pub fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{secret}{d}{stall}{d}{value}",
            secret = self.secret.as_str(),
            stall = self.stall,
            value = self.value,
            d = FIELD_DELIMITER
        ))
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("secret", &"<redacted>")
            .field("stall", &self.stall)
            .field("value", &self.value)
            .finish()
    }
}

/// Why a received report was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotUtf8,
    FieldCount(usize),
    BadSecret,
    UnknownSource(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotUtf8 => write!(f, "report is not valid utf-8"),
            Rejection::FieldCount(n) => {
                write!(f, "expected {} fields, got {}", FIELD_COUNT, n)
            }
            Rejection::BadSecret => write!(f, "shared secret mismatch"),
            Rejection::UnknownSource(name) => write!(f, "unknown stall '{}'", name),
        }
    }
}

impl std::error::Error for Rejection {}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StallCatalog {
        StallCatalog::new(["Drinks", "Snacks", "Malay 1"]).unwrap()
    }

    #[test]
    fn parses_and_validates_good_report() {
        let report = Report::parse(b"secret|Malay 1|~3").unwrap();
        assert_eq!(report.stall, "Malay 1");
        assert_eq!(report.value, "~3");
        let catalog = catalog();
        let source = report.validate("secret", &catalog).unwrap();
        assert_eq!(source.as_str(), "Malay 1");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert_eq!(
            Report::parse(b"secret|Drinks").unwrap_err(),
            Rejection::FieldCount(2)
        );
        assert_eq!(
            Report::parse(b"secret|Drinks|5|extra").unwrap_err(),
            Rejection::FieldCount(4)
        );
        assert_eq!(Report::parse(b"").unwrap_err(), Rejection::FieldCount(1));
    }

    #[test]
    fn bad_secret_and_unknown_stall_are_rejected() {
        let catalog = catalog();
        let report = Report::parse(b"wrongsecret|Drinks|5").unwrap();
        assert_eq!(
            report.validate("secret", &catalog).unwrap_err(),
            Rejection::BadSecret
        );
        let report = Report::parse(b"secret|Bogus|5").unwrap();
        assert_eq!(
            report.validate("secret", &catalog).unwrap_err(),
            Rejection::UnknownSource("Bogus".to_string())
        );
    }

    #[test]
    fn non_utf8_payload_is_rejected() {
        assert_eq!(
            Report::parse(&[0xff, b'|', b'a', b'|', b'b']).unwrap_err(),
            Rejection::NotUtf8
        );
    }

    #[test]
    fn value_is_kept_verbatim() {
        let report = Report::parse(b"secret|Drinks|0.9\n").unwrap();
        assert_eq!(report.value, "0.9\n");
    }

    #[test]
    fn outgoing_report_refuses_delimiter() {
        assert!(Report::new("secret", "Drinks", "1|2").is_err());
        let report = Report::new("secret", "Drinks", "~4").unwrap();
        assert_eq!(report.encode().as_str(), "secret|Drinks|~4");
    }

    #[test]
    fn debug_output_redacts_secret() {
        let report = Report::new("hunter2", "Drinks", "~4").unwrap();
        let rendered = format!("{:?}", report);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Drinks"));
    }
}
