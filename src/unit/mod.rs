//! Per-unit execution engine.
//!
//! Units run as independently addressable, single-threaded-per-identity
//! actors: one mailbox, one message processed to completion at a time, so
//! per-unit state needs no internal locking. The roles share
//! [`ExecutionCore`], the buffering, barrier-alignment and delivery-counter
//! component, by composition; [`source::SourceUnit`] and
//! [`operator::OperatorUnit`] layer role behavior on top.

/// Stateless and stateful operator units.
pub mod operator;
/// The ingress unit.
pub mod source;
/// Keyed state with reverse and incremental logs.
pub mod state;

#[cfg(test)]
mod operator_test;

use crate::message::{Message, MessageKind, TrackingInfo, UnitId};
use crate::partitioning::PartitionError;
use crate::persist::PersistError;
use crate::tracker::TrackerError;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Error type for unit execution.
#[derive(Error, Debug)]
pub enum UnitError {
    /// A normal message arrived for a batch below the current one; batches
    /// never regress outside an explicit recovery.
    #[error("batch regression: received {batch_id}, current {current}")]
    BatchRegression {
        /// Batch carried by the offending message.
        batch_id: i64,
        /// Batch the unit is processing.
        current: i64,
    },
    /// A control message arrived without tracking info.
    #[error("control message for batch {0} carries no tracking info")]
    MissingTracking(i64),
    /// A barrier claimed a different number of deliveries than observed.
    #[error("delivery count mismatch from {origin} in batch {batch_id}: claimed {claimed}, received {received}")]
    DeliveryCountMismatch {
        /// Upstream unit whose claim failed.
        origin: UnitId,
        /// Batch the claim was for.
        batch_id: i64,
        /// Count carried by the barrier.
        claimed: u64,
        /// Count observed on this edge.
        received: u64,
    },
    /// Partitioning failed (no downstream targets).
    #[error(transparent)]
    Partition(#[from] PartitionError),
    /// Tracker interaction failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Durable log interaction failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// What to do with an observed message.
#[derive(Debug)]
pub enum Disposition {
    /// Process now.
    Deliver(Message),
    /// Stored for a future batch; released at barrier alignment.
    Buffered,
}

/// One pending control wave round: arrivals so far, with the tracking info
/// and claimed delivery count each arrival carried.
#[derive(Debug, Default)]
struct ControlRound {
    arrived: u32,
    stashed: Vec<(UnitId, TrackingInfo, u64)>,
}

/// Shared buffering, alignment and delivery-count state machine.
///
/// `current_batch_id` is the batch the unit is actively processing; it
/// advances only at commit (or is reset by recovery). `released_up_to`
/// tracks how far barrier alignment has unblocked processing ahead of the
/// commit: aligning the barrier for batch `b` releases batch `b + 1`.
/// The invariant `released_up_to >= current_batch_id` holds throughout.
#[derive(Debug)]
pub struct ExecutionCore {
    /// The batch this unit is actively processing.
    pub current_batch_id: i64,
    upstream_count: u32,
    released_up_to: i64,
    buffer: VecDeque<Message>,
    barrier_rounds: HashMap<i64, ControlRound>,
    commit_rounds: HashMap<i64, ControlRound>,
    recovery_rounds: HashMap<i64, ControlRound>,
    received: HashMap<(UnitId, i64), u64>,
    sent: HashMap<(UnitId, i64), u64>,
}

impl ExecutionCore {
    /// Creates a core expecting barriers from `upstream_count` distinct
    /// senders per round.
    pub fn new(upstream_count: u32) -> Self {
        Self {
            current_batch_id: 0,
            upstream_count,
            released_up_to: 0,
            buffer: VecDeque::new(),
            barrier_rounds: HashMap::new(),
            commit_rounds: HashMap::new(),
            recovery_rounds: HashMap::new(),
            received: HashMap::new(),
            sent: HashMap::new(),
        }
    }

    /// Classifies an incoming message: control messages always deliver,
    /// normal messages deliver up to the released batch, buffer beyond it,
    /// and fail below the current batch.
    pub fn observe(&mut self, msg: Message) -> Result<Disposition, UnitError> {
        if msg.kind.is_control() {
            return Ok(Disposition::Deliver(msg));
        }
        if msg.batch_id < self.current_batch_id {
            return Err(UnitError::BatchRegression {
                batch_id: msg.batch_id,
                current: self.current_batch_id,
            });
        }
        if msg.batch_id <= self.released_up_to {
            return Ok(Disposition::Deliver(msg));
        }
        self.buffer.push_back(msg);
        Ok(Disposition::Buffered)
    }

    /// Counts one delivered normal message from `origin`, returning the new
    /// per-edge count for its batch.
    pub fn record_receipt(&mut self, origin: &UnitId, batch_id: i64) -> u64 {
        let count = self.received.entry((origin.clone(), batch_id)).or_insert(0);
        *count += 1;
        *count
    }

    /// Observed delivery count on the edge from `origin` for a batch.
    pub fn received_count(&self, origin: &UnitId, batch_id: i64) -> u64 {
        self.received
            .get(&(origin.clone(), batch_id))
            .copied()
            .unwrap_or(0)
    }

    /// Stamps the next outgoing normal message on the edge to `target`.
    pub fn next_edge_count(&mut self, target: &UnitId, batch_id: i64) -> u64 {
        let count = self.sent.entry((target.clone(), batch_id)).or_insert(0);
        *count += 1;
        *count
    }

    /// Total normal messages sent on the edge to `target` in a batch: the
    /// claim attached to the outgoing barrier.
    pub fn sent_count(&self, target: &UnitId, batch_id: i64) -> u64 {
        self.sent
            .get(&(target.clone(), batch_id))
            .copied()
            .unwrap_or(0)
    }

    fn rounds_mut(&mut self, kind: MessageKind) -> &mut HashMap<i64, ControlRound> {
        match kind {
            MessageKind::Barrier => &mut self.barrier_rounds,
            MessageKind::Commit => &mut self.commit_rounds,
            MessageKind::Recovery => &mut self.recovery_rounds,
            MessageKind::Normal => unreachable!("normal messages have no control round"),
        }
    }

    /// Records one control arrival for a round; returns true when the round
    /// has seen a message from every upstream sender and may act.
    pub fn control_arrived(
        &mut self,
        kind: MessageKind,
        batch_id: i64,
        origin: UnitId,
        info: TrackingInfo,
        claimed: u64,
    ) -> bool {
        let upstream = self.upstream_count;
        let round = self.rounds_mut(kind).entry(batch_id).or_default();
        round.arrived += 1;
        round.stashed.push((origin, info, claimed));
        round.arrived >= upstream
    }

    /// Takes and resets an aligned round, yielding what each arrival carried.
    pub fn take_round(&mut self, kind: MessageKind, batch_id: i64) -> Vec<(UnitId, TrackingInfo, u64)> {
        self.rounds_mut(kind)
            .remove(&batch_id)
            .map(|round| round.stashed)
            .unwrap_or_default()
    }

    /// Unblocks processing through batch `batch_id + 1` and drains the
    /// buffered messages of the released batches in original order.
    pub fn release_next(&mut self, batch_id: i64) -> Vec<Message> {
        if batch_id + 1 > self.released_up_to {
            self.released_up_to = batch_id + 1;
        }
        let released = self.released_up_to;
        let mut flushed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.buffer.len());
        for msg in self.buffer.drain(..) {
            if msg.batch_id <= released {
                flushed.push(msg);
            } else {
                kept.push_back(msg);
            }
        }
        self.buffer = kept;
        flushed
    }

    /// Advances past a committed batch and drops its delivery counters.
    pub fn advance_after_commit(&mut self, batch_id: i64) {
        self.current_batch_id = batch_id + 1;
        if self.released_up_to < self.current_batch_id {
            self.released_up_to = self.current_batch_id;
        }
        self.received.retain(|(_, b), _| *b > batch_id);
        self.sent.retain(|(_, b), _| *b > batch_id);
    }

    /// Resets the machine after a rollback to `target`: the unit resumes at
    /// `target + 1` with an empty buffer, fresh delivery counters and no
    /// pending barrier rounds (barrier tracking restarts cleanly; in-flight
    /// commit rounds are left alone, there is no cancellation of commits).
    pub fn reset_for_recovery(&mut self, target: i64) {
        self.current_batch_id = target + 1;
        self.released_up_to = self.current_batch_id;
        self.buffer.clear();
        self.barrier_rounds.clear();
        self.recovery_rounds.clear();
        self.received.clear();
        self.sent.clear();
    }

    /// Number of buffered messages (diagnostic).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
