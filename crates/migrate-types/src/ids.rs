//! Identifier newtypes shared by the wire codec and the engine.
//!
//! These wrap primitive types (`String`, `u32`, `u64`) rather than aliasing
//! them so that, e.g., an `EmigId` and an `InsertId` can never be swapped at
//! a call site by accident -- both are `u32` on the wire but mean different
//! things.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cluster node, as addressed by the fabric layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Logical dataset name a partition belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Partition identifier within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Process-unique, monotonically increasing identifier for one emigration job.
///
/// Unique for the lifetime of the process; reuse across process restarts is
/// fine because no migration survives one -- a restarted node starts every
/// partition transfer it was mid-way through over again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmigId(pub u32);

/// Per-record identifier, unique within one emigration's in-flight table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InsertId(pub u32);

/// Monotonically advancing cluster membership epoch.
///
/// Every migration message is stamped with the sender's snapshot of this
/// value; any mismatch against the live value aborts the migration it is
/// attached to, regardless of which phase it is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey(pub u64);

/// Monotonic version stamped on secondary records by one emigration, so
/// the receiver can reject stale copies left over from an aborted prior
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u64);

/// Fixed-width record key hash.
///
/// 20 bytes, matching the digest width used by production sharded KV
/// stores (SHA-1/RIPEMD-160-sized); the exact hash function is owned by
/// the storage layer and is opaque to this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 20]);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self([0u8; 20])
    }
}
