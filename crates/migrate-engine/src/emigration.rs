//! The emigration: the scheduled job of moving one partition to one
//! destination, and the worker-side state machine that drives it through
//! `START -> INSERT* -> DONE`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use migrate_types::{
    DonePayload, EmigId, InsertId, InsertPayload, MigrationMessage, Namespace, NodeId, Opcode,
    PartitionId, StartPayload, Version,
};

use crate::config::MigrationConfig;
use crate::counters::Counters;
use crate::error::MigrationError;
use crate::inflight::InFlightTable;
use crate::scheduler::{EmigrationJob, EnqueuePriority, SchedulerQueue};
use crate::traits::{Fabric, PartitionManager, PartitionState, Reservation, SendResult, Storage, TxOutcome};

/// One-shot, process-global monotonic counters for `emig_id` and
/// `insert_id`, matching the spec's "process-unique, monotonically
/// increasing" identity requirement (invariant 1 in spec.md §3). A wrap
/// after ~4 billion allocations would require billions of concurrent
/// in-flight emigrations/inserts, which the worker pool and in-flight
/// table sizes make physically impossible.
static NEXT_EMIG_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_INSERT_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_emig_id() -> EmigId {
    EmigId(NEXT_EMIG_ID.fetch_add(1, Ordering::Relaxed))
}

fn next_insert_id() -> InsertId {
    InsertId(NEXT_INSERT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Mints a fresh secondary-record version for one emigration's sub-tree.
pub fn next_version() -> Version {
    Version(NEXT_VERSION.fetch_add(1, Ordering::Relaxed))
}

/// The subset of `START_ACK_*`/`DONE_ACK` opcodes that cross from the
/// fabric-receive dispatcher to the owning worker via the control
/// channel. `INSERT_ACK` never travels this path -- it is applied
/// directly to the in-flight table by the dispatcher (see §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAck {
    StartAckOk,
    StartAckEagain,
    StartAckFail,
    StartAckAlreadyDone,
    DoneAck,
}

impl ControlAck {
    #[must_use]
    pub fn from_opcode(op: Opcode) -> Option<Self> {
        match op {
            Opcode::StartAckOk => Some(Self::StartAckOk),
            Opcode::StartAckEagain => Some(Self::StartAckEagain),
            Opcode::StartAckFail => Some(Self::StartAckFail),
            Opcode::StartAckAlreadyDone => Some(Self::StartAckAlreadyDone),
            Opcode::DoneAck => Some(Self::DoneAck),
            _ => None,
        }
    }
}

/// Emigration sub-protocol phase: secondary records stream first, then
/// the main tree. Monotonic -- never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubProtocolPhase {
    SubRecord,
    Record,
}

/// One in-progress (or about-to-start) emigration.
///
/// Shared-owned: the worker that pops it from the scheduler holds a
/// strong reference for its lifetime, the registry holds one for the
/// ack dispatcher to find, and `Arc` drop semantics stand in for the
/// spec's manual fabric-message refcounting (§9).
pub struct Emigration {
    pub emig_id: EmigId,
    pub job: EmigrationJob,
    /// Secondary-record version minted for this emigration's sub-tree.
    pub version: Version,
    pub inflight: InFlightTable,
    control_tx: mpsc::UnboundedSender<ControlAck>,
    control_rx: SyncMutex<Option<mpsc::UnboundedReceiver<ControlAck>>>,
}

impl Emigration {
    #[must_use]
    pub fn new(job: EmigrationJob) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            emig_id: next_emig_id(),
            job,
            version: next_version(),
            inflight: InFlightTable::new(),
            control_tx: tx,
            control_rx: SyncMutex::new(Some(rx)),
        })
    }

    /// Clones a sender onto this emigration's control channel. Held by
    /// the engine's ack dispatcher to forward `START_ACK_*`/`DONE_ACK`.
    #[must_use]
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlAck> {
        self.control_tx.clone()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.job.namespace
    }

    pub fn partition(&self) -> PartitionId {
        self.job.partition
    }

    pub fn destination(&self) -> &NodeId {
        &self.job.destination
    }

    fn take_control_rx(&self) -> mpsc::UnboundedReceiver<ControlAck> {
        self.control_rx
            .lock()
            .take()
            .expect("an emigration's control channel is taken exactly once, by its one worker")
    }
}

/// Dependencies the worker loop and state machine need. Bundled together
/// so `run_emigration` doesn't take six separate `Arc` parameters.
pub struct EngineDeps {
    pub fabric: Arc<dyn Fabric>,
    pub partition_manager: Arc<dyn PartitionManager>,
    pub storage: Arc<dyn Storage>,
    pub config: Arc<MigrationConfig>,
    pub counters: Arc<Counters>,
}

/// What the worker loop should do after one job comes off the queue.
pub enum JobOutcome {
    Finished(TxOutcome),
    /// The reservation observed `DESYNC` -- an undocumented, rare race
    /// (spec.md §9 marks it possibly unreachable). Re-queue at low
    /// priority and let the worker move on rather than busy-loop here.
    Requeue,
}

/// Runs one emigration to completion: reserve, `START`, stream
/// sub-records then records, drain the in-flight table, `DONE`, release.
///
/// Returns the outcome the caller (the worker loop) reports to the
/// partition manager via `migrate_tx_notify`.
pub async fn run_emigration(emigration: &Arc<Emigration>, deps: &EngineDeps) -> JobOutcome {
    let reservation = match deps
        .partition_manager
        .reserve(emigration.namespace(), emigration.partition())
        .await
    {
        Some(r) => r,
        None => {
            let err = MigrationError::ReservationFailed(emigration.partition());
            warn!(emig_id = emigration.emig_id.0, error = %err, "aborting emigration");
            return JobOutcome::Finished(TxOutcome::Err);
        }
    };

    match reservation.state() {
        PartitionState::Absent => {
            let err = MigrationError::ReservationFailed(emigration.partition());
            warn!(emig_id = emigration.emig_id.0, error = %err, "aborting emigration");
            deps.partition_manager.release(reservation);
            return JobOutcome::Finished(TxOutcome::Err);
        }
        PartitionState::Desync => {
            deps.partition_manager.release(reservation);
            return JobOutcome::Requeue;
        }
        PartitionState::Sync | PartitionState::Zombie => {}
    }

    let outcome = run_state_machine(emigration, deps, &*reservation).await;
    deps.partition_manager.release(reservation);

    let tx_outcome = match outcome {
        Ok(()) => TxOutcome::Done,
        Err(err) => {
            warn!(emig_id = emigration.emig_id.0, error = %err, "emigration aborted");
            TxOutcome::Err
        }
    };
    JobOutcome::Finished(tx_outcome)
}

async fn run_state_machine(
    emigration: &Arc<Emigration>,
    deps: &EngineDeps,
    _reservation: &dyn Reservation,
) -> Result<(), MigrationError> {
    let mut control_rx = emigration.take_control_rx();

    check_cluster_key(emigration, deps)?;

    let sub_records_enabled = deps.storage.sub_records_enabled(emigration.namespace());
    let incoming_version = sub_records_enabled.then_some(emigration.version);

    info!(
        emig_id = emigration.emig_id.0,
        partition = emigration.partition().0,
        destination = %emigration.destination(),
        "emigration starting"
    );

    send_start(emigration, deps, &mut control_rx, incoming_version).await?;

    let throttle = crate::traits::ReadThrottle {
        every_n: deps.config.migrate_read_priority,
        sleep: deps.config.migrate_read_sleep,
    };
    let records = deps
        .storage
        .snapshot(emigration.namespace(), emigration.partition(), throttle)
        .await;

    stream_records(emigration, deps, records).await?;
    drain_inflight(emigration, deps).await?;

    send_done(emigration, deps, &mut control_rx).await?;

    info!(emig_id = emigration.emig_id.0, "emigration done");
    Ok(())
}

fn check_cluster_key(emigration: &Emigration, deps: &EngineDeps) -> Result<(), MigrationError> {
    if deps.partition_manager.cluster_key() != emigration.job.cluster_key {
        deps.counters.cluster_key_abort();
        return Err(MigrationError::ClusterKeyChanged(emigration.emig_id));
    }
    Ok(())
}

async fn send_start(
    emigration: &Emigration,
    deps: &EngineDeps,
    control_rx: &mut mpsc::UnboundedReceiver<ControlAck>,
    incoming_version: Option<Version>,
) -> Result<(), MigrationError> {
    let message = MigrationMessage::Start(StartPayload {
        emig_id: emigration.emig_id,
        namespace: emigration.namespace().clone(),
        partition: emigration.partition(),
        cluster_key: emigration.job.cluster_key,
        incoming_version,
    });

    loop {
        check_cluster_key(emigration, deps)?;

        match send_with_retry(emigration, deps, &message).await {
            Ok(()) => {}
            Err(err) => return Err(err),
        }

        match timeout(deps.config.retx(), control_rx.recv()).await {
            Ok(Some(ControlAck::StartAckOk)) => return Ok(()),
            Ok(Some(ControlAck::StartAckAlreadyDone)) => {
                debug!(emig_id = emigration.emig_id.0, "peer already has this partition");
                return Ok(());
            }
            Ok(Some(ControlAck::StartAckFail)) => {
                return Err(MigrationError::StartRefused {
                    peer: emigration.destination().clone(),
                    partition: emigration.partition(),
                });
            }
            Ok(Some(ControlAck::StartAckEagain)) => {
                tokio::time::sleep(deps.config.spin_sleep).await;
            }
            Ok(Some(ControlAck::DoneAck)) => {
                // Stray ack from a prior attempt with this emig_id; ignore.
            }
            Ok(None) => return Err(MigrationError::NoPeer(emigration.destination().clone())),
            Err(_elapsed) => {
                deps.counters.retransmit();
            }
        }
    }
}

async fn send_done(
    emigration: &Emigration,
    deps: &EngineDeps,
    control_rx: &mut mpsc::UnboundedReceiver<ControlAck>,
) -> Result<(), MigrationError> {
    let message = MigrationMessage::Done(DonePayload {
        emig_id: emigration.emig_id,
        cluster_key: emigration.job.cluster_key,
    });

    loop {
        check_cluster_key(emigration, deps)?;

        send_with_retry(emigration, deps, &message).await?;

        match timeout(deps.config.retx(), control_rx.recv()).await {
            Ok(Some(ControlAck::DoneAck)) => return Ok(()),
            Ok(Some(_)) => {
                // Stray control ack (e.g. a duplicate START_ACK); ignore.
            }
            Ok(None) => return Err(MigrationError::NoPeer(emigration.destination().clone())),
            Err(_elapsed) => {
                deps.counters.retransmit();
            }
        }
    }
}

/// Sends one message, sleeping and retrying on `QUEUE_FULL` (a transient
/// condition, not an abort) and treating `NO_PEER`/`ERR` as fatal.
async fn send_with_retry(
    emigration: &Emigration,
    deps: &EngineDeps,
    message: &MigrationMessage,
) -> Result<(), MigrationError> {
    loop {
        match deps.fabric.send(emigration.destination(), message.clone()).await {
            SendResult::Ok => return Ok(()),
            SendResult::QueueFull => {
                tokio::time::sleep(deps.config.spin_sleep).await;
            }
            SendResult::NoPeer | SendResult::Err => {
                return Err(MigrationError::NoPeer(emigration.destination().clone()));
            }
        }
    }
}

async fn stream_records(
    emigration: &Emigration,
    deps: &EngineDeps,
    records: Vec<migrate_types::PickledRecord>,
) -> Result<(), MigrationError> {
    let mut phase = SubProtocolPhase::SubRecord;
    let mut sent_since_throttle = 0usize;

    for record in records {
        check_cluster_key(emigration, deps)?;

        if !record.is_sub_record() && phase == SubProtocolPhase::SubRecord {
            // spec.md §4.1: the sub-tree must be fully streamed *and
            // acknowledged* before the main tree starts -- drain the
            // in-flight table (retransmitting stale sub-record INSERTs
            // as needed) before this first main-tree record goes out.
            wait_until_inflight_drained(emigration, deps).await?;
            phase = SubProtocolPhase::Record;
            trace!(emig_id = emigration.emig_id.0, "phase SUBRECORD -> RECORD");
        }

        wait_for_back_pressure(emigration, deps).await?;

        let insert_id = next_insert_id();
        let message = MigrationMessage::Insert(InsertPayload {
            emig_id: emigration.emig_id,
            insert_id,
            namespace: emigration.namespace().clone(),
            partition: emigration.partition(),
            cluster_key: emigration.job.cluster_key,
            record,
        });
        emigration.inflight.insert(insert_id, message.clone());

        send_with_retry(emigration, deps, &message).await?;
        deps.counters.record_sent();

        sent_since_throttle += 1;
        if deps.config.migrate_xmit_priority > 0
            && sent_since_throttle % deps.config.migrate_xmit_priority == 0
        {
            tokio::time::sleep(deps.config.migrate_xmit_sleep).await;
        }
    }

    Ok(())
}

/// Pauses record emission once the in-flight table crosses the
/// high-water mark, resuming only once it has drained back below the
/// low-water mark (hysteresis prevents thrashing right at the boundary).
async fn wait_for_back_pressure(
    emigration: &Emigration,
    deps: &EngineDeps,
) -> Result<(), MigrationError> {
    if emigration.inflight.len() <= deps.config.migrate_xmit_hwm {
        return Ok(());
    }
    while emigration.inflight.len() >= deps.config.migrate_xmit_lwm {
        check_cluster_key(emigration, deps)?;
        tokio::time::sleep(deps.config.spin_sleep).await;
    }
    Ok(())
}

/// Retransmit loop: re-sends any in-flight entry whose last transmission
/// predates `RETX_MS`, stopping immediately on a fatal send error or
/// cluster-key change. Shared by the post-snapshot drain (`drain_inflight`)
/// and the SUBRECORD->RECORD phase boundary, both of which must not
/// proceed while the in-flight table is non-empty.
async fn wait_until_inflight_drained(
    emigration: &Emigration,
    deps: &EngineDeps,
) -> Result<(), MigrationError> {
    while !emigration.inflight.is_empty() {
        check_cluster_key(emigration, deps)?;

        let deadline = Instant::now() - deps.config.retx();
        for (insert_id, message) in emigration.inflight.due_for_retransmit(deadline) {
            match deps.fabric.send(emigration.destination(), message).await {
                SendResult::Ok => {
                    emigration.inflight.touch(insert_id);
                    deps.counters.retransmit();
                }
                SendResult::QueueFull => {
                    // Not fatal: the next reduce pass retries this entry.
                }
                SendResult::NoPeer | SendResult::Err => {
                    return Err(MigrationError::NoPeer(emigration.destination().clone()));
                }
            }
        }

        if !emigration.inflight.is_empty() {
            tokio::time::sleep(deps.config.retransmit_scan_interval).await;
        }
    }
    Ok(())
}

/// Runs after the snapshot buffer is drained: waits for the remaining
/// (main-tree) in-flight entries to be acked, retransmitting stale ones.
async fn drain_inflight(emigration: &Emigration, deps: &EngineDeps) -> Result<(), MigrationError> {
    wait_until_inflight_drained(emigration, deps).await
}

/// The emigration worker loop: repeatedly pops a job, runs it, reports
/// the outcome. Exits when it pops a `Terminate` sentinel.
pub async fn worker_loop(
    queue: Arc<SchedulerQueue>,
    deps: Arc<EngineDeps>,
    registry: Arc<crate::registry::EmigrationRegistry>,
) {
    loop {
        let pm = Arc::clone(&deps.partition_manager);
        let storage = Arc::clone(&deps.storage);
        let job = queue
            .reduce_pop(move |job: &EmigrationJob| {
                let state = pm.partition_state(&job.namespace, job.partition);
                let size = storage.partition_size(&job.namespace, job.partition);
                crate::scheduler::JobRank::new(state, job.marked_state_done, size)
            })
            .await;

        let job = match job {
            crate::scheduler::QueuedJob::Terminate => break,
            crate::scheduler::QueuedJob::Job(job) => job,
        };

        let namespace = job.namespace.clone();
        let partition = job.partition;
        let destination = job.destination.clone();

        let emigration = Emigration::new(job);
        registry.insert(Arc::clone(&emigration));
        deps.counters.emigration_started();

        let outcome = run_emigration(&emigration, &deps).await;

        registry.remove(emigration.emig_id);
        deps.counters.emigration_finished();

        match outcome {
            JobOutcome::Finished(tx_outcome) => {
                deps.partition_manager
                    .migrate_tx_notify(&namespace, partition, &destination, tx_outcome)
                    .await;
            }
            JobOutcome::Requeue => {
                tokio::time::sleep(deps.config.spin_sleep).await;
                queue.enqueue(
                    EmigrationJob {
                        namespace,
                        partition,
                        destination,
                        cluster_key: emigration.job.cluster_key,
                        tx_flags: emigration.job.tx_flags,
                        marked_state_done: emigration.job.marked_state_done,
                    },
                    EnqueuePriority::Low,
                );
            }
        }
    }
}
