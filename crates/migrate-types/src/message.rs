//! The migration wire message and its codec.
//!
//! Every migration message is a flat set of typed fields identified by
//! small integer tags. Numeric fields are big-endian on the wire. This is
//! deliberately hand-rolled rather than derived through `serde` -- the
//! tag/length framing here is a different, more primitive contract than
//! the MsgPack-tagged-enum protocols elsewhere in this codebase, and the
//! exact byte layout matters on its own rather than being an
//! implementation detail of some higher-level schema.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ids::{ClusterKey, Digest, EmigId, InsertId, Namespace, PartitionId, Version};
use crate::record::{PickledRecord, SubRecordFields};

/// One migration message opcode.
///
/// `Cancel` is a historical opcode: the encoder never emits it, but
/// `decode` accepts it and treats it identically to `Done`, since every
/// peer still running the old protocol needs its cancellations honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Start = 1,
    StartAckOk = 2,
    StartAckEagain = 3,
    StartAckFail = 4,
    StartAckAlreadyDone = 5,
    Insert = 6,
    InsertAck = 7,
    Done = 8,
    DoneAck = 9,
    Cancel = 10,
}

impl Opcode {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Start,
            2 => Self::StartAckOk,
            3 => Self::StartAckEagain,
            4 => Self::StartAckFail,
            5 => Self::StartAckAlreadyDone,
            6 => Self::Insert,
            7 => Self::InsertAck,
            8 => Self::Done,
            9 => Self::DoneAck,
            10 => Self::Cancel,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Field tags
// ---------------------------------------------------------------------------

mod tag {
    pub const OP: u8 = 0;
    pub const EMIG_ID: u8 = 1;
    pub const EMIG_INSERT_ID: u8 = 2;
    pub const NAMESPACE: u8 = 3;
    pub const PARTITION: u8 = 4;
    pub const DIGEST: u8 = 5;
    pub const GENERATION: u8 = 6;
    pub const VOID_TIME: u8 = 7;
    pub const RECORD: u8 = 8;
    pub const REC_PROPS: u8 = 9;
    pub const CLUSTER_KEY: u8 = 10;
    pub const INFO: u8 = 12;
    pub const VERSION: u8 = 13;
    pub const PDIGEST: u8 = 14;
    pub const EDIGEST: u8 = 15;
    pub const PGENERATION: u8 = 16;
    pub const PVOID_TIME: u8 = 17;
    pub const END: u8 = 255;
}

/// `INFO` bitmask flags.
pub mod info_flags {
    pub const IS_PARENT: u32 = 1 << 0;
    pub const IS_SUBREC: u32 = 1 << 1;
    pub const IS_ESR: u32 = 1 << 2;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: expected {expected} more bytes, found {found}")]
    UnexpectedEof { expected: usize, found: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("message is missing required field `{0}` for its opcode")]
    MissingField(&'static str),
    #[error("digest field has wrong length: expected 20, found {0}")]
    BadDigestLength(usize),
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `START`: announces the beginning of one emigration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPayload {
    pub emig_id: EmigId,
    pub namespace: Namespace,
    pub partition: PartitionId,
    pub cluster_key: ClusterKey,
    /// Secondary-record version in flight for this partition, if the
    /// namespace has the secondary-record feature enabled.
    pub incoming_version: Option<Version>,
}

/// `INSERT`: one pickled record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPayload {
    pub emig_id: EmigId,
    pub insert_id: InsertId,
    pub namespace: Namespace,
    pub partition: PartitionId,
    pub cluster_key: ClusterKey,
    pub record: PickledRecord,
}

/// `INSERT_ACK`: acknowledges one record. Carries only `emig_id` and the
/// original `insert_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertAckPayload {
    pub emig_id: EmigId,
    pub insert_id: InsertId,
}

/// `DONE`: the sender's tree (and sub-tree, if any) has been fully
/// streamed and acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DonePayload {
    pub emig_id: EmigId,
    pub cluster_key: ClusterKey,
}

/// Shared shape of `START_ACK_*` and `DONE_ACK`: these are pure control
/// acks that only need to route back to the right emigration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAckPayload {
    pub emig_id: EmigId,
    pub cluster_key: ClusterKey,
}

/// The decoded form of one migration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationMessage {
    Start(StartPayload),
    StartAckOk(ControlAckPayload),
    StartAckEagain(ControlAckPayload),
    StartAckFail(ControlAckPayload),
    StartAckAlreadyDone(ControlAckPayload),
    Insert(InsertPayload),
    InsertAck(InsertAckPayload),
    Done(DonePayload),
    DoneAck(ControlAckPayload),
}

impl MigrationMessage {
    #[must_use]
    pub fn emig_id(&self) -> EmigId {
        match self {
            Self::Start(p) => p.emig_id,
            Self::StartAckOk(p)
            | Self::StartAckEagain(p)
            | Self::StartAckFail(p)
            | Self::StartAckAlreadyDone(p)
            | Self::DoneAck(p) => p.emig_id,
            Self::Insert(p) => p.emig_id,
            Self::InsertAck(p) => p.emig_id,
            Self::Done(p) => p.emig_id,
        }
    }

    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Start(_) => Opcode::Start,
            Self::StartAckOk(_) => Opcode::StartAckOk,
            Self::StartAckEagain(_) => Opcode::StartAckEagain,
            Self::StartAckFail(_) => Opcode::StartAckFail,
            Self::StartAckAlreadyDone(_) => Opcode::StartAckAlreadyDone,
            Self::Insert(_) => Opcode::Insert,
            Self::InsertAck(_) => Opcode::InsertAck,
            Self::Done(_) => Opcode::Done,
            Self::DoneAck(_) => Opcode::DoneAck,
        }
    }

    /// Encodes this message to its wire representation.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_u32(&mut buf, tag::OP, self.opcode() as u32);

        match self {
            Self::Start(p) => {
                put_u32(&mut buf, tag::EMIG_ID, p.emig_id.0);
                put_bytes(&mut buf, tag::NAMESPACE, p.namespace.0.as_bytes());
                put_u32(&mut buf, tag::PARTITION, p.partition.0);
                put_u64(&mut buf, tag::CLUSTER_KEY, p.cluster_key.0);
                if let Some(v) = p.incoming_version {
                    put_u64(&mut buf, tag::VERSION, v.0);
                }
            }
            Self::StartAckOk(p)
            | Self::StartAckEagain(p)
            | Self::StartAckFail(p)
            | Self::StartAckAlreadyDone(p)
            | Self::DoneAck(p) => {
                put_u32(&mut buf, tag::EMIG_ID, p.emig_id.0);
                put_u64(&mut buf, tag::CLUSTER_KEY, p.cluster_key.0);
            }
            Self::Insert(p) => {
                put_u32(&mut buf, tag::EMIG_ID, p.emig_id.0);
                put_u32(&mut buf, tag::EMIG_INSERT_ID, p.insert_id.0);
                put_bytes(&mut buf, tag::NAMESPACE, p.namespace.0.as_bytes());
                put_u32(&mut buf, tag::PARTITION, p.partition.0);
                put_u64(&mut buf, tag::CLUSTER_KEY, p.cluster_key.0);
                put_digest(&mut buf, tag::DIGEST, &p.record.digest);
                put_u32(&mut buf, tag::GENERATION, p.record.generation);
                put_u32(&mut buf, tag::VOID_TIME, p.record.void_time);
                put_bytes(&mut buf, tag::RECORD, &p.record.body);
                if let Some(props) = &p.record.rec_props {
                    put_bytes(&mut buf, tag::REC_PROPS, props);
                }
                let mut info = 0u32;
                if let Some(sub) = &p.record.sub_record {
                    info |= info_flags::IS_SUBREC;
                    put_u32(&mut buf, tag::INFO, info);
                    put_u64(&mut buf, tag::VERSION, sub.version.0);
                    put_digest(&mut buf, tag::PDIGEST, &sub.parent_digest);
                    put_digest(&mut buf, tag::EDIGEST, &sub.esr_digest);
                    put_u32(&mut buf, tag::PGENERATION, sub.parent_generation);
                    put_u32(&mut buf, tag::PVOID_TIME, sub.parent_void_time);
                } else {
                    put_u32(&mut buf, tag::INFO, info);
                }
            }
            Self::InsertAck(p) => {
                put_u32(&mut buf, tag::EMIG_ID, p.emig_id.0);
                put_u32(&mut buf, tag::EMIG_INSERT_ID, p.insert_id.0);
            }
            Self::Done(p) => {
                put_u32(&mut buf, tag::EMIG_ID, p.emig_id.0);
                put_u64(&mut buf, tag::CLUSTER_KEY, p.cluster_key.0);
            }
        }

        buf.put_u8(tag::END);
        buf.freeze()
    }

    /// Decodes a message from its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the buffer is truncated, names an
    /// unknown opcode, is missing a field required by its opcode, or a
    /// digest field has the wrong length.
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let mut raw = RawFields::default();
        loop {
            let t = read_u8(&mut buf)?;
            if t == tag::END {
                break;
            }
            match t {
                tag::OP => raw.op = Some(read_u32(&mut buf)?),
                tag::EMIG_ID => raw.emig_id = Some(read_u32(&mut buf)?),
                tag::EMIG_INSERT_ID => raw.insert_id = Some(read_u32(&mut buf)?),
                tag::NAMESPACE => raw.namespace = Some(read_bytes(&mut buf)?),
                tag::PARTITION => raw.partition = Some(read_u32(&mut buf)?),
                tag::DIGEST => raw.digest = Some(read_digest(&mut buf)?),
                tag::GENERATION => raw.generation = Some(read_u32(&mut buf)?),
                tag::VOID_TIME => raw.void_time = Some(read_u32(&mut buf)?),
                tag::RECORD => raw.record = Some(read_bytes(&mut buf)?),
                tag::REC_PROPS => raw.rec_props = Some(read_bytes(&mut buf)?),
                tag::CLUSTER_KEY => raw.cluster_key = Some(read_u64(&mut buf)?),
                tag::INFO => raw.info = Some(read_u32(&mut buf)?),
                tag::VERSION => raw.version = Some(read_u64(&mut buf)?),
                tag::PDIGEST => raw.pdigest = Some(read_digest(&mut buf)?),
                tag::EDIGEST => raw.edigest = Some(read_digest(&mut buf)?),
                tag::PGENERATION => raw.pgeneration = Some(read_u32(&mut buf)?),
                tag::PVOID_TIME => raw.pvoid_time = Some(read_u32(&mut buf)?),
                // Unknown tags are forward-compatibility slack: skip is not
                // possible without a length, so treat as the four known
                // fixed shapes only; anything else is a malformed message.
                _ => return Err(CodecError::MissingField("unknown tag")),
            }
        }
        raw.into_message()
    }
}

#[derive(Default)]
struct RawFields {
    op: Option<u32>,
    emig_id: Option<u32>,
    insert_id: Option<u32>,
    namespace: Option<Vec<u8>>,
    partition: Option<u32>,
    digest: Option<Digest>,
    generation: Option<u32>,
    void_time: Option<u32>,
    record: Option<Vec<u8>>,
    rec_props: Option<Vec<u8>>,
    cluster_key: Option<u64>,
    info: Option<u32>,
    version: Option<u64>,
    pdigest: Option<Digest>,
    edigest: Option<Digest>,
    pgeneration: Option<u32>,
    pvoid_time: Option<u32>,
}

impl RawFields {
    fn into_message(self) -> Result<MigrationMessage, CodecError> {
        let op = self.op.ok_or(CodecError::MissingField("OP"))?;
        let opcode = Opcode::from_u32(op).ok_or(CodecError::UnknownOpcode(op))?;
        let emig_id = EmigId(self.emig_id.ok_or(CodecError::MissingField("EMIG_ID"))?);

        let control_ack = |this: &Self| -> Result<ControlAckPayload, CodecError> {
            Ok(ControlAckPayload {
                emig_id,
                cluster_key: ClusterKey(
                    this.cluster_key
                        .ok_or(CodecError::MissingField("CLUSTER_KEY"))?,
                ),
            })
        };

        Ok(match opcode {
            Opcode::Start => MigrationMessage::Start(StartPayload {
                emig_id,
                namespace: Namespace(bytes_to_string(
                    self.namespace.ok_or(CodecError::MissingField("NAMESPACE"))?,
                )),
                partition: PartitionId(self.partition.ok_or(CodecError::MissingField("PARTITION"))?),
                cluster_key: ClusterKey(
                    self.cluster_key
                        .ok_or(CodecError::MissingField("CLUSTER_KEY"))?,
                ),
                incoming_version: self.version.map(Version),
            }),
            Opcode::StartAckOk => MigrationMessage::StartAckOk(control_ack(&self)?),
            Opcode::StartAckEagain => MigrationMessage::StartAckEagain(control_ack(&self)?),
            Opcode::StartAckFail => MigrationMessage::StartAckFail(control_ack(&self)?),
            Opcode::StartAckAlreadyDone => {
                MigrationMessage::StartAckAlreadyDone(control_ack(&self)?)
            }
            Opcode::Insert => {
                let info = self.info.unwrap_or(0);
                let sub_record = if info & info_flags::IS_SUBREC != 0 {
                    Some(SubRecordFields {
                        parent_digest: self.pdigest.ok_or(CodecError::MissingField("PDIGEST"))?,
                        esr_digest: self.edigest.ok_or(CodecError::MissingField("EDIGEST"))?,
                        parent_generation: self
                            .pgeneration
                            .ok_or(CodecError::MissingField("PGENERATION"))?,
                        parent_void_time: self
                            .pvoid_time
                            .ok_or(CodecError::MissingField("PVOID_TIME"))?,
                        version: Version(self.version.ok_or(CodecError::MissingField("VERSION"))?),
                    })
                } else {
                    None
                };
                MigrationMessage::Insert(InsertPayload {
                    emig_id,
                    insert_id: InsertId(
                        self.insert_id
                            .ok_or(CodecError::MissingField("EMIG_INSERT_ID"))?,
                    ),
                    namespace: Namespace(bytes_to_string(
                        self.namespace.ok_or(CodecError::MissingField("NAMESPACE"))?,
                    )),
                    partition: PartitionId(
                        self.partition.ok_or(CodecError::MissingField("PARTITION"))?,
                    ),
                    cluster_key: ClusterKey(
                        self.cluster_key
                            .ok_or(CodecError::MissingField("CLUSTER_KEY"))?,
                    ),
                    record: PickledRecord {
                        digest: self.digest.ok_or(CodecError::MissingField("DIGEST"))?,
                        generation: self
                            .generation
                            .ok_or(CodecError::MissingField("GENERATION"))?,
                        void_time: self.void_time.ok_or(CodecError::MissingField("VOID_TIME"))?,
                        body: self.record.ok_or(CodecError::MissingField("RECORD"))?,
                        rec_props: self.rec_props,
                        sub_record,
                    },
                })
            }
            Opcode::InsertAck => MigrationMessage::InsertAck(InsertAckPayload {
                emig_id,
                insert_id: InsertId(
                    self.insert_id
                        .ok_or(CodecError::MissingField("EMIG_INSERT_ID"))?,
                ),
            }),
            // CANCEL is decoded identically to DONE.
            Opcode::Done | Opcode::Cancel => MigrationMessage::Done(DonePayload {
                emig_id,
                cluster_key: ClusterKey(
                    self.cluster_key
                        .ok_or(CodecError::MissingField("CLUSTER_KEY"))?,
                ),
            }),
            Opcode::DoneAck => MigrationMessage::DoneAck(control_ack(&self)?),
        })
    }
}

fn bytes_to_string(b: Vec<u8>) -> String {
    String::from_utf8_lossy(&b).into_owned()
}

// ---------------------------------------------------------------------------
// Low-level put/read helpers
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut BytesMut, t: u8, v: u32) {
    buf.put_u8(t);
    buf.put_u32(v);
}

fn put_u64(buf: &mut BytesMut, t: u8, v: u64) {
    buf.put_u8(t);
    buf.put_u64(v);
}

fn put_bytes(buf: &mut BytesMut, t: u8, v: &[u8]) {
    buf.put_u8(t);
    buf.put_u32(v.len() as u32);
    buf.put_slice(v);
}

fn put_digest(buf: &mut BytesMut, t: u8, d: &Digest) {
    buf.put_u8(t);
    buf.put_slice(&d.0);
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::UnexpectedEof {
            expected: 1,
            found: 0,
        });
    }
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::UnexpectedEof {
            expected: 4,
            found: buf.len(),
        });
    }
    Ok(buf.get_u32())
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    if buf.len() < 8 {
        return Err(CodecError::UnexpectedEof {
            expected: 8,
            found: buf.len(),
        });
    }
    Ok(buf.get_u64())
}

fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(buf)? as usize;
    if buf.len() < len {
        return Err(CodecError::UnexpectedEof {
            expected: len,
            found: buf.len(),
        });
    }
    let mut v = vec![0u8; len];
    buf.copy_to_slice(&mut v);
    Ok(v)
}

fn read_digest(buf: &mut &[u8]) -> Result<Digest, CodecError> {
    if buf.len() < 20 {
        return Err(CodecError::BadDigestLength(buf.len()));
    }
    let mut d = [0u8; 20];
    buf.copy_to_slice(&mut d);
    Ok(Digest(d))
}
