//! Error taxonomy for the migration engine.
//!
//! Most of the taxonomy never reaches an `Err`: transport backpressure is
//! retried, `EAGAIN` is retried, "already done" is treated as success.
//! What remains here is what genuinely aborts an emigration/immigration or
//! signals a caller mistake.

use migrate_types::{EmigId, NodeId, PartitionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("no connection to peer {0}")]
    NoPeer(NodeId),

    #[error("peer {peer} refused START for partition {partition:?}")]
    StartRefused { peer: NodeId, partition: PartitionId },

    #[error("cluster key changed mid-migration (emig_id={0:?})")]
    ClusterKeyChanged(EmigId),

    #[error("partition {0:?} could not be reserved")]
    ReservationFailed(PartitionId),

    #[error("storage merge rejected the record: {0}")]
    MergeRejected(String),

    /// Transient "get_create failed" race from the storage layer.
    /// Callers treat this as success; it is an `Err` variant only so the
    /// `?` operator can distinguish it from an outright merge failure.
    #[error("benign storage race on merge")]
    BenignStorageRace,

    #[error("no emigration registered with emig_id {0:?}")]
    UnknownEmigration(EmigId),
}
