//! The pickled-record representation: a record serialized into a
//! self-contained byte blob plus metadata, suitable for wire transmission
//! and direct merge on the receiver.

use crate::ids::{Digest, Version};

/// Extra fields carried only by secondary ("sub-") records.
///
/// Secondary records belong to a parent record in a composite data
/// structure; they migrate as a sub-tree before the parent tree and carry
/// a version tag so the receiver can recognize and reject stale copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRecordFields {
    pub parent_digest: Digest,
    pub esr_digest: Digest,
    pub parent_generation: u32,
    pub parent_void_time: u32,
    pub version: Version,
}

/// A single record snapshotted from a partition's index, ready to stream
/// to a destination node.
///
/// `rec_props` and `sub_record` are optional: most records have neither
/// extra properties nor secondary-record lineage, and the wire codec
/// omits absent fields entirely rather than encoding an empty marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickledRecord {
    pub digest: Digest,
    pub generation: u32,
    /// Expiration timestamp (TTL).
    pub void_time: u32,
    pub body: Vec<u8>,
    pub rec_props: Option<Vec<u8>>,
    pub sub_record: Option<SubRecordFields>,
}

impl PickledRecord {
    #[must_use]
    pub fn is_sub_record(&self) -> bool {
        self.sub_record.is_some()
    }

    /// `true` if `other` would win a merge against `self` under the
    /// (generation, void_time) winner rule used throughout the protocol.
    #[must_use]
    pub fn is_superseded_by(&self, other: &PickledRecord) -> bool {
        (other.generation, other.void_time) > (self.generation, self.void_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(generation: u32, void_time: u32) -> PickledRecord {
        PickledRecord {
            digest: Digest::default(),
            generation,
            void_time,
            body: vec![],
            rec_props: None,
            sub_record: None,
        }
    }

    #[test]
    fn higher_generation_wins() {
        let old = rec(1, 100);
        let new = rec(5, 50);
        assert!(old.is_superseded_by(&new));
        assert!(!new.is_superseded_by(&old));
    }

    #[test]
    fn equal_generation_tiebreaks_on_void_time() {
        let old = rec(3, 10);
        let new = rec(3, 20);
        assert!(old.is_superseded_by(&new));
    }

    #[test]
    fn identical_record_does_not_supersede_itself() {
        let a = rec(1, 1);
        let b = rec(1, 1);
        assert!(!a.is_superseded_by(&b));
    }
}
