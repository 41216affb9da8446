//! Admin counters backing `MigrationEngine::dump`.
//!
//! Mirrors the teacher's use of the `metrics` crate for gauges/counters:
//! these are published through the global `metrics` recorder (so whatever
//! exporter the embedding binary installs picks them up) and also kept as
//! plain atomics for `dump()` to read back synchronously, since the
//! `metrics` facade has no read side.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};

const EMIGRATIONS_ACTIVE: &str = "migrate.emigrations.active";
const IMMIGRATIONS_ACTIVE: &str = "migrate.immigrations.active";
const RECORDS_SENT: &str = "migrate.records.sent";
const RECORDS_ACKED: &str = "migrate.records.acked";
const RETRANSMITS: &str = "migrate.retransmits";
const CLUSTER_KEY_ABORTS: &str = "migrate.cluster_key_aborts";

/// Process-wide migration counters.
///
/// `active_*` track live gauges (set, not accumulated); the rest are
/// monotonic counters for the lifetime of the process.
#[derive(Debug, Default)]
pub struct Counters {
    emigrations_active: AtomicU64,
    immigrations_active: AtomicU64,
    records_sent: AtomicU64,
    records_acked: AtomicU64,
    retransmits: AtomicU64,
    cluster_key_aborts: AtomicU64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emigration_started(&self) {
        let n = self.emigrations_active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(EMIGRATIONS_ACTIVE).set(n as f64);
    }

    pub fn emigration_finished(&self) {
        let n = self.emigrations_active.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(EMIGRATIONS_ACTIVE).set(n as f64);
    }

    pub fn immigration_started(&self) {
        let n = self.immigrations_active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(IMMIGRATIONS_ACTIVE).set(n as f64);
    }

    pub fn immigration_finished(&self) {
        let n = self.immigrations_active.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(IMMIGRATIONS_ACTIVE).set(n as f64);
    }

    pub fn record_sent(&self) {
        self.records_sent.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_SENT).increment(1);
    }

    pub fn record_acked(&self) {
        self.records_acked.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_ACKED).increment(1);
    }

    pub fn retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
        counter!(RETRANSMITS).increment(1);
    }

    pub fn cluster_key_abort(&self) {
        self.cluster_key_aborts.fetch_add(1, Ordering::Relaxed);
        counter!(CLUSTER_KEY_ABORTS).increment(1);
    }

    #[must_use]
    pub fn emigrations_active(&self) -> u64 {
        self.emigrations_active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn immigrations_active(&self) -> u64 {
        self.immigrations_active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            emigrations_active: self.emigrations_active.load(Ordering::Relaxed),
            immigrations_active: self.immigrations_active.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_acked: self.records_acked.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            cluster_key_aborts: self.cluster_key_aborts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time read of [`Counters`], for tests and `dump()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub emigrations_active: u64,
    pub immigrations_active: u64,
    pub records_sent: u64,
    pub records_acked: u64,
    pub retransmits: u64,
    pub cluster_key_aborts: u64,
}
