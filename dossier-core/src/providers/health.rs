//! Per-backend health counters.
//!
//! Slots are allocated once, when the coordinator is built, one per distinct
//! backend id. Each slot is a set of atomics, so concurrent research tasks
//! update counters without locking and without coordinating across backends.
//! Health is advisory: it never influences backend selection.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Point-in-time view of one backend's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend: String,
    pub successes: u64,
    pub failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct HealthSlot {
    backend: String,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Milliseconds since the epoch; 0 means "never failed".
    last_failure_ms: AtomicI64,
}

impl HealthSlot {
    fn new(backend: String) -> Self {
        Self {
            backend,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_failure_ms: AtomicI64::new(0),
        }
    }

    fn snapshot(&self) -> BackendHealth {
        let last_ms = self.last_failure_ms.load(Ordering::Acquire);
        BackendHealth {
            backend: self.backend.clone(),
            successes: self.successes.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
            last_failure: (last_ms != 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
        }
    }
}

/// Fixed arena of health slots keyed by backend id.
#[derive(Debug, Default)]
pub struct HealthTable {
    slots: Vec<HealthSlot>,
    index: HashMap<String, usize>,
}

impl HealthTable {
    /// Allocate one slot per distinct id, in first-seen order.
    pub fn new<I, S>(backend_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for id in backend_ids {
            let id = id.into();
            if !table.index.contains_key(&id) {
                table.index.insert(id.clone(), table.slots.len());
                table.slots.push(HealthSlot::new(id));
            }
        }
        table
    }

    /// Slot index for a backend id.
    pub fn slot_of(&self, backend: &str) -> Option<usize> {
        self.index.get(backend).copied()
    }

    pub fn record_success(&self, slot: usize) {
        if let Some(s) = self.slots.get(slot) {
            s.successes.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn record_failure(&self, slot: usize) {
        if let Some(s) = self.slots.get(slot) {
            s.failures.fetch_add(1, Ordering::AcqRel);
            s.last_failure_ms
                .store(Utc::now().timestamp_millis().max(1), Ordering::Release);
        }
    }

    pub fn get(&self, backend: &str) -> Option<BackendHealth> {
        self.slot_of(backend).map(|i| self.slots[i].snapshot())
    }

    /// All slots in allocation order.
    pub fn snapshot(&self) -> Vec<BackendHealth> {
        self.slots.iter().map(HealthSlot::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
