//! Per-profile write accounting.
//!
//! Every message handed to the scheduler is attributed to the profile tag of
//! the workflow that sent it. The totals make it easy to see which panel or
//! poll loop dominates the link's bandwidth.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Totals for one profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub messages: u64,
    pub bytes: u64,
}

/// Thread-safe per-profile counters.
#[derive(Default)]
pub struct WriteStats {
    by_profile: Mutex<BTreeMap<String, ProfileStats>>,
}

impl WriteStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one message of `len` bytes against `profile`.
    pub fn record(&self, profile: &str, len: usize) {
        let mut map = self.by_profile.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(profile.to_owned()).or_default();
        entry.messages += 1;
        entry.bytes += len as u64;
    }

    pub fn get(&self, profile: &str) -> ProfileStats {
        self.by_profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile)
            .copied()
            .unwrap_or_default()
    }

    /// All profiles, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, ProfileStats> {
        self.by_profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> ProfileStats {
        self.snapshot()
            .values()
            .fold(ProfileStats::default(), |acc, s| ProfileStats {
                messages: acc.messages + s.messages,
                bytes: acc.bytes + s.bytes,
            })
    }

    pub fn reset(&self) {
        self.by_profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
