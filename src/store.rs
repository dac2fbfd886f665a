//! Aggregate store: latest reported wait time per stall.
//!
//! The store is the only shared mutable state in the collector. Writers
//! (`set` from the report listener, `tick` from the sweeper) take the write
//! half of an `RwLock`, so no reader ever sees an entry half-updated and a
//! tick can never interleave with a set. `snapshot` copies under the read
//! half and returns owned data.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::{SourceId, StallCatalog};

/// Text shown by consumers for a stall with no fresh value.
pub const UNSET_SENTINEL: &str = "???";

/// Ticks without a report after which a value is cleared.
pub const DEFAULT_STALE_AFTER_TICKS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateEntry {
    pub source: SourceId,
    /// Latest accepted value, `None` until reported or once stale.
    pub value: Option<String>,
    /// Ticks since the last accepted report (or since startup).
    pub age_secs: u64,
}

impl AggregateEntry {
    /// Value as consumers display it: the reported text or [`UNSET_SENTINEL`].
    pub fn display_value(&self) -> &str {
        self.value.as_deref().unwrap_or(UNSET_SENTINEL)
    }
}

/// Point-in-time copy of every entry, in catalog order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: Vec<AggregateEntry>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&AggregateEntry> {
        self.entries.iter().find(|entry| entry.source.as_str() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregateEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct AggregateStore {
    catalog: Arc<StallCatalog>,
    stale_after: u64,
    entries: Arc<RwLock<Vec<AggregateEntry>>>,
}

impl AggregateStore {
    /// Create a store with one unset entry per catalog stall.
    pub fn new(catalog: StallCatalog, stale_after: u64) -> Result<Self> {
        if stale_after == 0 {
            return Err(anyhow!("staleness threshold must be greater than zero"));
        }
        let entries = catalog
            .iter()
            .map(|source| AggregateEntry {
                source: source.clone(),
                value: None,
                age_secs: 0,
            })
            .collect();
        Ok(Self {
            catalog: Arc::new(catalog),
            stale_after,
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    pub fn catalog(&self) -> &StallCatalog {
        &self.catalog
    }

    pub fn stale_after(&self) -> u64 {
        self.stale_after
    }

    /// Record a fresh value for `source` and reset its age.
    ///
    /// `source` must come from this store's catalog; anything else is a
    /// caller bug and is reported as an error without touching state.
    pub fn set(&self, source: &SourceId, value: impl Into<String>) -> Result<()> {
        let mut entries = self.write()?;
        let entry = entries
            .iter_mut()
            .find(|entry| &entry.source == source)
            .ok_or_else(|| anyhow!("stall '{}' is not in the catalog", source))?;
        entry.value = Some(value.into());
        entry.age_secs = 0;
        Ok(())
    }

    /// Age every entry by one tick and clear values that reached the
    /// threshold. Returns the stalls whose value was cleared by this tick.
    pub fn tick(&self) -> Result<Vec<SourceId>> {
        let mut entries = self.write()?;
        let mut expired = Vec::new();
        for entry in entries.iter_mut() {
            entry.age_secs = entry.age_secs.saturating_add(1);
            if entry.age_secs >= self.stale_after && entry.value.take().is_some() {
                expired.push(entry.source.clone());
            }
        }
        Ok(expired)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let entries = self.read()?;
        Ok(Snapshot {
            entries: entries.clone(),
        })
    }

    /// Current entry for a stall, or `None` if the name is not in the catalog.
    pub fn get(&self, name: &str) -> Result<Option<AggregateEntry>> {
        let entries = self.read()?;
        Ok(entries
            .iter()
            .find(|entry| entry.source.as_str() == name)
            .cloned())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<AggregateEntry>>> {
        self.entries
            .read()
            .map_err(|_| anyhow!("aggregate store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<AggregateEntry>>> {
        self.entries
            .write()
            .map_err(|_| anyhow!("aggregate store lock poisoned"))
    }
}
