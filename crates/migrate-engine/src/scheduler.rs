//! The emigration scheduler: a priority-aware job queue with a
//! `reduce_pop` dequeue operation.
//!
//! Modeled as two FIFO lanes (`high`, `low`) behind a `parking_lot::Mutex`
//! with a `tokio::sync::Notify` for wakeup -- queue depth here is "one job
//! per partition currently rebalancing," not general-purpose traffic, so a
//! linear scan per pop is the right tool, not a `BinaryHeap`: the
//! comparator depends on live partition size, which changes while jobs
//! are queued, and a heap cannot re-rank on every pop.

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use migrate_types::{ClusterKey, NodeId, PartitionId};

use crate::traits::PartitionState;

/// Lane a job was enqueued into. `High` is scanned to exhaustion before
/// `Low` is considered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePriority {
    High,
    Low,
}

/// Caller-supplied flags on an emigration job. Opaque to the scheduler;
/// forwarded onto the `Emigration` for the caller's own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(pub u32);

/// One scheduled unit of work: move one partition to one destination.
#[derive(Debug, Clone)]
pub struct EmigrationJob {
    pub namespace: migrate_types::Namespace,
    pub partition: PartitionId,
    pub destination: NodeId,
    pub cluster_key: ClusterKey,
    pub tx_flags: TxFlags,
    /// Set by the caller when the partition manager has already marked
    /// this partition's rebalance decision final ("state done"), ranking
    /// it ahead of ordinary jobs but behind `ZOMBIE` partitions.
    pub marked_state_done: bool,
}

/// One entry in a scheduler lane: a real job, or the `null` sentinel used
/// to terminate exactly one worker for pool shrinkage.
#[derive(Debug, Clone)]
pub enum QueuedJob {
    Job(EmigrationJob),
    Terminate,
}

/// Sort key computed fresh on every `reduce_pop`, since both the
/// partition's live state and its size can change while a job sits in
/// the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobRank {
    class: SortClass,
    /// Smaller partitions rank higher; stored inverted so `Ord` picks the
    /// numerically larger (i.e. smallest-partition) rank as "best".
    inverted_size: Reverse<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SortClass {
    Other = 0,
    StateDone = 1,
    Zombie = 2,
}

impl JobRank {
    #[must_use]
    pub fn new(partition_state: PartitionState, marked_state_done: bool, element_count: u64) -> Self {
        let class = if partition_state == PartitionState::Zombie {
            SortClass::Zombie
        } else if marked_state_done {
            SortClass::StateDone
        } else {
            SortClass::Other
        };
        Self {
            class,
            inverted_size: Reverse(element_count),
        }
    }
}

/// The priority queue of pending emigration jobs.
#[derive(Default)]
pub struct SchedulerQueue {
    high: Mutex<VecDeque<QueuedJob>>,
    low: Mutex<VecDeque<QueuedJob>>,
    notify: Notify,
}

impl SchedulerQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, job: EmigrationJob, priority: EnqueuePriority) {
        self.enqueue_raw(QueuedJob::Job(job), priority);
    }

    /// Pushes a `null` terminator. A worker popping it exits its loop
    /// instead of running an emigration -- the standard way to shrink the
    /// pool without losing any queued real job.
    pub fn enqueue_terminator(&self, priority: EnqueuePriority) {
        self.enqueue_raw(QueuedJob::Terminate, priority);
    }

    fn enqueue_raw(&self, job: QueuedJob, priority: EnqueuePriority) {
        let lane = match priority {
            EnqueuePriority::High => &self.high,
            EnqueuePriority::Low => &self.low,
        };
        lane.lock().push_back(job);
        self.notify.notify_one();
    }

    /// Pops the best candidate across the high lane (searched to
    /// exhaustion first) then the low lane, ranking queued jobs with
    /// `rank_of`. Blocks until a job is available.
    pub async fn reduce_pop<F>(&self, rank_of: F) -> QueuedJob
    where
        F: Fn(&EmigrationJob) -> JobRank,
    {
        loop {
            if let Some(job) = self.try_reduce_pop(&rank_of) {
                return job;
            }
            self.notify.notified().await;
        }
    }

    fn try_reduce_pop<F>(&self, rank_of: &F) -> Option<QueuedJob>
    where
        F: Fn(&EmigrationJob) -> JobRank,
    {
        for lane in [&self.high, &self.low] {
            let mut guard = lane.lock();
            if guard.is_empty() {
                continue;
            }
            // A queued Terminate sentinel always wins immediately: it
            // exists purely to stop one worker, and the jobs behind it
            // must stay queued for whichever worker pops next.
            if let Some(pos) = guard.iter().position(|j| matches!(j, QueuedJob::Terminate)) {
                return Some(guard.remove(pos).expect("position was just found"));
            }

            let mut best_idx = 0;
            let mut best_rank: Option<JobRank> = None;
            for (idx, item) in guard.iter().enumerate() {
                let QueuedJob::Job(job) = item else { continue };
                let rank = rank_of(job);
                let replace = match best_rank {
                    None => true,
                    Some(b) => rank > b,
                };
                if replace {
                    best_rank = Some(rank);
                    best_idx = idx;
                }
            }
            return guard.remove(best_idx);
        }
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.high.lock().len() + self.low.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_state() -> impl Strategy<Value = PartitionState> {
        prop_oneof![
            Just(PartitionState::Absent),
            Just(PartitionState::Desync),
            Just(PartitionState::Sync),
            Just(PartitionState::Zombie),
        ]
    }

    proptest! {
        // Zombie always outranks every non-zombie class, regardless of how
        // the partition sizes compare -- spec.md §4.1's ordering is
        // lexicographic (class first, size only breaks ties within a
        // class), never a weighted sum where a big enough size difference
        // could let a non-zombie job jump ahead.
        #[test]
        fn zombie_outranks_non_zombie_at_any_size(
            zombie_size in any::<u64>(),
            other_state in arb_state(),
            other_marked_done in any::<bool>(),
            other_size in any::<u64>(),
        ) {
            prop_assume!(other_state != PartitionState::Zombie);
            let zombie_rank = JobRank::new(PartitionState::Zombie, false, zombie_size);
            let other_rank = JobRank::new(other_state, other_marked_done, other_size);
            prop_assert!(zombie_rank > other_rank);
        }

        // Within a fixed class, a strictly smaller element count always
        // ranks at least as high as a larger one.
        #[test]
        fn smaller_partition_never_ranks_below_larger_in_same_class(
            state in arb_state(),
            marked_done in any::<bool>(),
            small in 0u64..1_000,
            extra in 0u64..1_000,
        ) {
            let big = small + extra;
            let small_rank = JobRank::new(state, marked_done, small);
            let big_rank = JobRank::new(state, marked_done, big);
            prop_assert!(small_rank >= big_rank);
        }
    }
}
