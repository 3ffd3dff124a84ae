//! Per-domain dwell time accumulation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Accumulated dwell for one domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwellEntry {
    pub total_secs: u64,
    pub visits: u32,
}

/// Domain -> accumulated dwell, since the last successful digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DwellAccumulator {
    by_domain: BTreeMap<String, DwellEntry>,
}

impl DwellAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one counted session in. Empty domains are ignored.
    pub fn add(&mut self, domain: &str, secs: u64) {
        if domain.is_empty() {
            return;
        }
        let entry = self.by_domain.entry(domain.to_string()).or_default();
        entry.total_secs += secs;
        entry.visits += 1;
    }

    pub fn get(&self, domain: &str) -> Option<DwellEntry> {
        self.by_domain.get(domain).copied()
    }

    pub fn total_secs(&self) -> u64 {
        self.by_domain.values().map(|e| e.total_secs).sum()
    }

    pub fn totals(&self) -> &BTreeMap<String, DwellEntry> {
        &self.by_domain
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Take away dwell that has already been reported, keeping anything
    /// accumulated since `reported` was read.
    pub fn subtract(&mut self, reported: &BTreeMap<String, DwellEntry>) {
        for (domain, seen) in reported {
            let Some(entry) = self.by_domain.get_mut(domain) else {
                continue;
            };
            entry.total_secs = entry.total_secs.saturating_sub(seen.total_secs);
            entry.visits = entry.visits.saturating_sub(seen.visits);
            if entry.visits == 0 && entry.total_secs == 0 {
                self.by_domain.remove(domain);
            }
        }
    }
}
