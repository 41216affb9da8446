//! Configuration knobs consumed by the migration engine.
//!
//! Mirrors the teacher's `ServerConfig`/`ClusterConfig` pattern: a plain
//! struct with a hand-written `Default` rather than a derive, because the
//! defaults here are knob-specific values tuned for production traffic,
//! not zeroes.

use std::time::Duration;

/// One-to-one with the configuration knobs table in the migration spec.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Size of the emigration worker pool.
    pub n_migrate_threads: usize,

    /// In-flight table high-water mark: emission pauses once the table
    /// holds this many outstanding `INSERT`s.
    pub migrate_xmit_hwm: usize,

    /// In-flight table low-water mark: emission resumes once the table
    /// has drained back down to this size.
    pub migrate_xmit_lwm: usize,

    /// Number of records pickled and sent between throttle sleeps on the
    /// emigration side.
    pub migrate_xmit_priority: usize,

    /// Duration of the throttle sleep taken every `migrate_xmit_priority`
    /// records sent.
    pub migrate_xmit_sleep: Duration,

    /// Number of records read from the partition index between throttle
    /// sleeps while snapshotting a tree.
    pub migrate_read_priority: usize,

    /// Duration of the throttle sleep taken every `migrate_read_priority`
    /// records pickled.
    pub migrate_read_sleep: Duration,

    /// Grace period an immigration survives after its first `DONE`,
    /// absorbing retransmitted `DONE`s and stray late `INSERT`s.
    pub migrate_rx_lifetime_ms: u64,

    /// Retransmit interval for both data (`INSERT`) and control
    /// (`START`/`DONE`) messages. Spec calls this `RETX_MS`.
    pub transaction_retry_ms: u64,

    /// Back-pressure / queue-full / START_ACK_EAGAIN spin sleep.
    pub spin_sleep: Duration,

    /// Interval between retransmit-table reduce passes.
    pub retransmit_scan_interval: Duration,

    /// Interval between immigration reaper sweeps. Spec fixes this at
    /// once per second; kept configurable for tests.
    pub reaper_interval: Duration,
}

impl MigrationConfig {
    #[must_use]
    pub fn retx(&self) -> Duration {
        Duration::from_millis(self.transaction_retry_ms)
    }

    #[must_use]
    pub fn rx_lifetime(&self) -> Duration {
        Duration::from_millis(self.migrate_rx_lifetime_ms)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            n_migrate_threads: 4,
            migrate_xmit_hwm: 256,
            migrate_xmit_lwm: 64,
            migrate_xmit_priority: 10,
            migrate_xmit_sleep: Duration::from_millis(1),
            migrate_read_priority: 10,
            migrate_read_sleep: Duration::from_millis(1),
            migrate_rx_lifetime_ms: 60_000,
            transaction_retry_ms: 1_000,
            spin_sleep: Duration::from_millis(10),
            retransmit_scan_interval: Duration::from_millis(50),
            reaper_interval: Duration::from_secs(1),
        }
    }
}
