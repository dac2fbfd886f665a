//! Stall catalog.
//!
//! The catalog is the fixed set of stalls the collector tracks. It is built
//! once at startup from configuration and never changes afterwards; a report
//! naming a stall outside the catalog is refused before it reaches the store.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

/// Stalls served by the reference deployment, in display order.
pub const DEFAULT_STALLS: [&str; 8] = [
    "Drinks",
    "Snacks",
    "Malay 1",
    "Malay 2",
    "Western",
    "Chicken Rice",
    "Oriental Taste",
    "CLOSED",
];

/// Name of a stall that is a member of a [`StallCatalog`].
///
/// Only the catalog hands these out, so holding a `SourceId` means the name
/// was validated against the catalog it came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StallCatalog {
    stalls: Vec<SourceId>,
}

impl StallCatalog {
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut stalls = Vec::new();
        for name in names {
            let name = name.as_ref();
            validate_stall_name(name)?;
            if !seen.insert(name.to_string()) {
                return Err(anyhow!("duplicate stall name '{}' in catalog", name));
            }
            stalls.push(SourceId(name.to_string()));
        }
        if stalls.is_empty() {
            return Err(anyhow!("stall catalog must contain at least one stall"));
        }
        Ok(Self { stalls })
    }

    /// Look up a stall by its exact (case-sensitive) name.
    pub fn lookup(&self, name: &str) -> Option<&SourceId> {
        self.stalls.iter().find(|id| id.as_str() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceId> {
        self.stalls.iter()
    }

    pub fn len(&self) -> usize {
        self.stalls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stalls.is_empty()
    }
}

impl Default for StallCatalog {
    fn default() -> Self {
        Self {
            stalls: DEFAULT_STALLS
                .iter()
                .map(|name| SourceId(name.to_string()))
                .collect(),
        }
    }
}

/// A stall name is plain text that survives the `|`-delimited wire format
/// and a URL query string: letters, digits, space, `_` and `-`, 1..=64 chars.
pub fn validate_stall_name(name: &str) -> Result<()> {
    static STALL_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = STALL_NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _-]{0,63}$").expect("stall name pattern")
    });
    if !re.is_match(name) {
        return Err(anyhow!(
            "stall name '{}' must match ^[A-Za-z0-9][A-Za-z0-9 _-]{{0,63}}$",
            name
        ));
    }
    Ok(())
}
