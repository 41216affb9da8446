//! The immigration: in-memory state tracking one inbound partition from
//! one source, and the receive-side dispatch for `START`/`INSERT`/`DONE`.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex as SyncMutex;
use tracing::{debug, warn};

use migrate_types::{
    ClusterKey, ControlAckPayload, DonePayload, EmigId, InsertAckPayload, InsertPayload,
    MigrationMessage, Namespace, NodeId, PartitionId, StartPayload, Version,
};

use crate::config::MigrationConfig;
use crate::counters::Counters;
use crate::error::MigrationError;
use crate::registry::{ImmigrationRegistry, SubRecordVersionIndex};
use crate::traits::{Fabric, PartitionManager, Reservation, RxAdmit, RxEvent, Storage};

const PHASE_SUBRECORD: u8 = 0;
const PHASE_RECORD: u8 = 1;

/// One inbound partition transfer, keyed by `(source, emig_id)` in the
/// immigration registry.
pub struct Immigration {
    pub source: NodeId,
    pub emig_id: EmigId,
    pub cluster_key: ClusterKey,
    pub namespace: Namespace,
    pub partition: PartitionId,
    pub incoming_version: Option<Version>,
    reservation: SyncMutex<Option<Arc<dyn Reservation>>>,
    phase: AtomicU8,
    done_received: AtomicU32,
    start_timestamp: Instant,
    done_timestamp: SyncMutex<Option<Instant>>,
}

impl Immigration {
    #[must_use]
    pub fn new(
        source: NodeId,
        emig_id: EmigId,
        cluster_key: ClusterKey,
        namespace: Namespace,
        partition: PartitionId,
        incoming_version: Option<Version>,
    ) -> Self {
        Self {
            source,
            emig_id,
            cluster_key,
            namespace,
            partition,
            incoming_version,
            reservation: SyncMutex::new(None),
            phase: AtomicU8::new(PHASE_SUBRECORD),
            done_received: AtomicU32::new(0),
            start_timestamp: Instant::now(),
            done_timestamp: SyncMutex::new(None),
        }
    }

    pub fn set_reservation(&self, reservation: Arc<dyn Reservation>) {
        *self.reservation.lock() = Some(reservation);
    }

    pub fn take_reservation(&self) -> Option<Arc<dyn Reservation>> {
        self.reservation.lock().take()
    }

    #[must_use]
    pub fn start_timestamp(&self) -> Instant {
        self.start_timestamp
    }

    #[must_use]
    pub fn done_received(&self) -> u32 {
        self.done_received.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn done_timestamp(&self) -> Option<Instant> {
        *self.done_timestamp.lock()
    }

    /// Flips `SUBRECORD -> RECORD` the first time a non-sub-record
    /// `INSERT` is observed. Monotonic: never regresses to `SUBRECORD`.
    pub fn advance_phase_if_main(&self, is_sub_record: bool) {
        if !is_sub_record {
            self.phase.store(PHASE_RECORD, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_in_record_phase(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_RECORD
    }

    /// Atomically bumps `done_received` and reports whether this call
    /// was the first (the only one that should fire side effects).
    #[must_use]
    pub fn mark_done(&self) -> bool {
        self.done_received.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub fn set_done_timestamp(&self) {
        *self.done_timestamp.lock() = Some(Instant::now());
    }
}

/// Dependencies the receive-side dispatch needs. A separate bundle from
/// the emigration side's `EngineDeps` because it also needs the
/// immigration registry and version index, which the emigration side
/// never touches.
pub struct ImmigrationCtx {
    pub fabric: Arc<dyn Fabric>,
    pub partition_manager: Arc<dyn PartitionManager>,
    pub storage: Arc<dyn Storage>,
    pub config: Arc<MigrationConfig>,
    pub counters: Arc<Counters>,
    pub immigrations: Arc<ImmigrationRegistry>,
    pub version_index: Arc<SubRecordVersionIndex>,
}

async fn reply(ctx: &ImmigrationCtx, to: &NodeId, message: MigrationMessage) {
    // The receiver never retries control replies itself -- if this send
    // fails the sender's own retransmit loop will produce another
    // request for us to answer.
    let _ = ctx.fabric.send(to, message).await;
}

pub async fn handle_start(src: NodeId, payload: StartPayload, ctx: &ImmigrationCtx) {
    let current_key = ctx.partition_manager.cluster_key();
    if current_key != payload.cluster_key {
        reply(
            ctx,
            &src,
            MigrationMessage::StartAckEagain(ControlAckPayload {
                emig_id: payload.emig_id,
                cluster_key: current_key,
            }),
        )
        .await;
        return;
    }

    let admit = ctx
        .partition_manager
        .migrate_rx_notify(&payload.namespace, payload.partition, &src, RxEvent::Admit)
        .await;

    let ack_op = match admit {
        RxAdmit::Fail => Some(MigrationMessage::StartAckFail(ControlAckPayload {
            emig_id: payload.emig_id,
            cluster_key: current_key,
        })),
        RxAdmit::Again => Some(MigrationMessage::StartAckEagain(ControlAckPayload {
            emig_id: payload.emig_id,
            cluster_key: current_key,
        })),
        RxAdmit::AlreadyDone => Some(MigrationMessage::StartAckAlreadyDone(ControlAckPayload {
            emig_id: payload.emig_id,
            cluster_key: current_key,
        })),
        RxAdmit::Ok => None,
    };
    if let Some(ack) = ack_op {
        reply(ctx, &src, ack).await;
        return;
    }

    let Some(reservation) = ctx
        .partition_manager
        .reserve(&payload.namespace, payload.partition)
        .await
    else {
        reply(
            ctx,
            &src,
            MigrationMessage::StartAckFail(ControlAckPayload {
                emig_id: payload.emig_id,
                cluster_key: current_key,
            }),
        )
        .await;
        return;
    };

    if ctx.partition_manager.cluster_key() != payload.cluster_key {
        ctx.partition_manager.release(reservation);
        reply(
            ctx,
            &src,
            MigrationMessage::StartAckEagain(ControlAckPayload {
                emig_id: payload.emig_id,
                cluster_key: ctx.partition_manager.cluster_key(),
            }),
        )
        .await;
        return;
    }

    let immigration = Arc::new(Immigration::new(
        src.clone(),
        payload.emig_id,
        payload.cluster_key,
        payload.namespace.clone(),
        payload.partition,
        payload.incoming_version,
    ));
    immigration.set_reservation(reservation);

    if ctx.immigrations.insert_if_absent(Arc::clone(&immigration)) {
        if let Some(version) = payload.incoming_version {
            ctx.version_index
                .insert(version, payload.partition, Arc::clone(&immigration));
        }
        ctx.counters.immigration_started();
    } else {
        // Duplicate START for an already-registered (source, emig_id):
        // discard the new immigration silently, release the reservation
        // it took, and still ACK OK -- the original immigration is
        // unaffected.
        debug!(
            emig_id = payload.emig_id.0,
            source = %src,
            "duplicate START, discarding"
        );
        if let Some(r) = immigration.take_reservation() {
            ctx.partition_manager.release(r);
        }
    }

    reply(
        ctx,
        &src,
        MigrationMessage::StartAckOk(ControlAckPayload {
            emig_id: payload.emig_id,
            cluster_key: payload.cluster_key,
        }),
    )
    .await;
}

pub async fn handle_insert(src: NodeId, payload: InsertPayload, ctx: &ImmigrationCtx) {
    let ack = MigrationMessage::InsertAck(InsertAckPayload {
        emig_id: payload.emig_id,
        insert_id: payload.insert_id,
    });

    let Some(immigration) = ctx.immigrations.get(&src, payload.emig_id) else {
        // Belongs to a prior cluster key (or a source we never admitted).
        // Still ACK so the sender's in-flight table drains.
        reply(ctx, &src, ack).await;
        return;
    };

    if immigration.cluster_key != ctx.partition_manager.cluster_key() {
        // Drop without ACK -- the sender observes its own cluster-key
        // change and aborts on its next loop iteration.
        return;
    }

    let is_sub_record = payload.record.is_sub_record();
    immigration.advance_phase_if_main(is_sub_record);

    match ctx
        .storage
        .merge(&payload.namespace, payload.partition, payload.record)
        .await
    {
        Ok(()) => {}
        Err(MigrationError::BenignStorageRace) => {
            debug!(
                emig_id = payload.emig_id.0,
                "benign get_create race on merge, treating insert as accepted"
            );
        }
        Err(err) => {
            warn!(emig_id = payload.emig_id.0, error = %err, "merge failed, dropping insert without ack");
            return;
        }
    }

    reply(ctx, &src, ack).await;
}

pub async fn handle_done(src: NodeId, payload: DonePayload, ctx: &ImmigrationCtx) {
    let ack = MigrationMessage::DoneAck(ControlAckPayload {
        emig_id: payload.emig_id,
        cluster_key: payload.cluster_key,
    });

    let Some(immigration) = ctx.immigrations.get(&src, payload.emig_id) else {
        // Defensive: ACK even when we have no record of this emigration.
        reply(ctx, &src, ack).await;
        return;
    };

    if immigration.mark_done() {
        immigration.set_done_timestamp();
        ctx.partition_manager
            .migrate_rx_notify(&immigration.namespace, immigration.partition, &src, RxEvent::Done)
            .await;
        ctx.counters.immigration_finished();

        if immigration.incoming_version.is_some() {
            // The sub-record phase ran ahead of this DONE and left a now-stale
            // secondary-record sub-tree behind; compact it. Non-fatal: a
            // failure just means the stale sub-tree waits for the next
            // successful immigration to retry.
            if let Err(err) = ctx
                .storage
                .flatten(&immigration.namespace, immigration.partition)
                .await
            {
                warn!(
                    emig_id = payload.emig_id.0,
                    error = %err,
                    "flatten failed, stale sub-record tree left in place"
                );
            }
        }

        if ctx.config.migrate_rx_lifetime_ms == 0 {
            if let Some(imm) = ctx.immigrations.remove(&src, payload.emig_id) {
                if let Some(r) = imm.take_reservation() {
                    ctx.partition_manager.release(r);
                }
            }
            if let Some(version) = immigration.incoming_version {
                ctx.version_index.remove(version, immigration.partition);
            }
        }
    }

    reply(ctx, &src, ack).await;
}
