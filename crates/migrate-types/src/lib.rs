//! Wire and domain types for the partition migration protocol.
//!
//! This crate has no engine behavior: it defines the identifiers, the
//! pickled-record representation, and the on-the-wire message codec that
//! `migrate-engine` builds its emigration/immigration state machines on.

pub mod ids;
pub mod message;
pub mod record;

pub use ids::{ClusterKey, Digest, EmigId, InsertId, Namespace, NodeId, PartitionId, Version};
pub use message::{
    CodecError, ControlAckPayload, DonePayload, InsertAckPayload, InsertPayload, MigrationMessage,
    Opcode, StartPayload,
};
pub use record::{PickledRecord, SubRecordFields};
