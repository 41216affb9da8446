//! Traits the engine depends on but does not implement.
//!
//! The engine schedules transfers, streams records, and tracks acks; it
//! does not own the network, the partition ownership table, or the record
//! storage itself. Those live behind these three traits so the engine can
//! be driven by fakes in tests and by the real subsystems in production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use migrate_types::{ClusterKey, MigrationMessage, Namespace, NodeId, PartitionId, PickledRecord};

use crate::error::MigrationError;

/// Read-throttle parameters for [`Storage::snapshot`], carrying
/// `migrate_read_priority`/`migrate_read_sleep` down to the storage
/// implementation so it can pace index iteration the way spec.md §4.1
/// describes ("optional yield sleeps every N records... to throttle read
/// pressure on storage") -- the engine itself never sees individual
/// records until the whole snapshot returns, so only the storage side
/// can actually honor this knob.
#[derive(Debug, Clone, Copy)]
pub struct ReadThrottle {
    /// Sleep after every this many records pickled. Zero disables the
    /// throttle.
    pub every_n: usize,
    pub sleep: Duration,
}

/// Outcome of attempting to hand one message to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Accepted for delivery. Does not imply the peer received it.
    Ok,
    /// The outbound queue to this peer is over its high-water mark; the
    /// caller should back off and retry rather than treat this as fatal.
    QueueFull,
    /// No connection to this peer exists right now.
    NoPeer,
    /// Hard send failure (peer gone, serialization failed).
    Err,
}

/// Send-side view of the cluster transport.
///
/// Implementations own connection pooling, framing, and retries below the
/// message level; the engine only ever calls `send`.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Sends one migration message to `to`. Never blocks past a queue-full
    /// check -- callers are responsible for retrying on `QueueFull`.
    async fn send(&self, to: &NodeId, message: MigrationMessage) -> SendResult;
}

/// Live state of a partition as the partition manager sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Absent,
    Desync,
    Sync,
    Zombie,
}

/// Final outcome an emigration worker reports back after it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Done,
    Err,
}

/// Result of asking the partition manager to admit an inbound migration,
/// on both START (admission) and DONE (completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAdmit {
    Ok,
    Again,
    Fail,
    AlreadyDone,
}

/// Which inbound event is being reported to `migrate_rx_notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEvent {
    Admit,
    Done,
}

/// A reference-counted handle over a partition that keeps it pinned for
/// the duration of one migration. Dropping the last clone is equivalent
/// to calling `release`; the engine also calls `release` explicitly on
/// worker exit so the partition manager can act immediately rather than
/// waiting on a `Drop`.
pub trait Reservation: Send + Sync {
    fn namespace(&self) -> &Namespace;
    fn partition(&self) -> PartitionId;
    /// Live state, re-read on every call -- a reservation does not cache
    /// the state it was taken under.
    fn state(&self) -> PartitionState;
}

/// Ownership and membership-epoch authority.
#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Current cluster membership epoch. Every outbound message is
    /// stamped with this value, and every inbound message is checked
    /// against it.
    fn cluster_key(&self) -> ClusterKey;

    /// Live partition state, queried without taking a reservation. Used
    /// by the scheduler's `reduce_pop` to rank `ZOMBIE` partitions ahead
    /// of everything else.
    fn partition_state(&self, namespace: &Namespace, partition: PartitionId) -> PartitionState;

    /// Pins `partition` for the duration of one migration. `None` means
    /// the partition cannot be reserved right now (e.g. it is `Absent`).
    async fn reserve(
        &self,
        namespace: &Namespace,
        partition: PartitionId,
    ) -> Option<Arc<dyn Reservation>>;

    /// Releases a reservation taken with `reserve`.
    fn release(&self, reservation: Arc<dyn Reservation>);

    /// Reports the final outcome of one emigration.
    async fn migrate_tx_notify(
        &self,
        namespace: &Namespace,
        partition: PartitionId,
        to: &NodeId,
        outcome: TxOutcome,
    );

    /// Admits (on START) or completes (on DONE) one inbound migration.
    async fn migrate_rx_notify(
        &self,
        namespace: &Namespace,
        partition: PartitionId,
        from: &NodeId,
        event: RxEvent,
    ) -> RxAdmit;
}

/// Per-partition record access the scheduler and emigration workers read
/// from, and immigration handlers write into.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Approximate number of records resident in `partition`, used by the
    /// scheduler's size-ascending tiebreak. Does not need to be exact.
    fn partition_size(&self, namespace: &Namespace, partition: PartitionId) -> u64;

    /// `true` if `namespace` has the secondary-record (sub-record/ESR)
    /// feature enabled. When set, emigrations for this namespace stamp a
    /// fresh version on every sub-record and the `START` message carries
    /// it so the receiver can reject stale copies.
    fn sub_records_enabled(&self, namespace: &Namespace) -> bool;

    /// Snapshots every record in `partition` into pickled form, secondary
    /// records first, ready to stream to the wire. `throttle` paces the
    /// underlying index iteration; implementations that iterate cheaply
    /// (e.g. an in-memory index) may ignore it.
    async fn snapshot(
        &self,
        namespace: &Namespace,
        partition: PartitionId,
        throttle: ReadThrottle,
    ) -> Vec<PickledRecord>;

    /// Merges one incoming record into the local index, applying the
    /// (generation, void_time) winner rule against any existing copy.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::BenignStorageRace`] for a transient
    /// "get_create failed" race the caller should treat as success, and
    /// any other error for a genuine merge failure.
    async fn merge(
        &self,
        namespace: &Namespace,
        partition: PartitionId,
        record: PickledRecord,
    ) -> Result<(), MigrationError>;

    /// Flattens (compacts) `partition`'s secondary-record index once a
    /// complete, newer version has replaced it. A failure here is
    /// recoverable: the stale sub-tree is left in place and retried on
    /// the next successful immigration.
    async fn flatten(&self, namespace: &Namespace, partition: PartitionId) -> anyhow::Result<()>;
}
