//! Batch propagation tracking.
//!
//! The tracker owns two independent sets of batch records, one for barrier
//! waves and one for commit waves, plus the append-only sets of finalized batch
//! ids that reject late or duplicate activity after finalization. A third,
//! transient map tracks recovery waves (no finalized set; a rollback target
//! may legitimately be revisited).
//!
//! [`BatchTracker`] is the pure bookkeeping core; [`spawn_tracker`] wraps it
//! in an actor that forwards wave-completion decisions to the coordinator.

use crate::coordinator::CoordinatorHandle;
use crate::message::{Message, TrackingInfo, UnitId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Error type for tracker operations. Every variant is a protocol violation:
/// it indicates a broken invariant at the caller, not a transient condition.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    /// A control message arrived without tracking info.
    #[error("control message for batch {0} carries no tracking info")]
    MissingTracking(i64),
    /// Barrier and commit waves never use negative batch ids.
    #[error("invalid batch id: {0}")]
    NegativeBatch(i64),
    /// A record for an already finalized batch would be recreated.
    #[error("batch {0} already finalized")]
    AlreadyFinalized(i64),
    /// Completion reported for a batch with no active record.
    #[error("no active record for batch {0}")]
    UnknownBatch(i64),
    /// Completion reported for a wave the record does not contain.
    #[error("no wave registered by {id} in batch {batch_id}")]
    UnknownWave {
        /// Batch the report was for.
        batch_id: i64,
        /// Unit the report named.
        id: UnitId,
    },
    /// A wave would complete more acknowledgements than it expects.
    #[error("over-completion of wave {id} in batch {batch_id}")]
    OverComplete {
        /// Batch the report was for.
        batch_id: i64,
        /// Unit whose wave overflowed.
        id: UnitId,
    },
    /// The tracker actor is gone.
    #[error("tracker channel closed")]
    ChannelClosed,
}

/// Bookkeeping for one in-flight batch of one propagation kind.
#[derive(Clone, Debug)]
pub struct BatchRecord {
    /// Batch identifier.
    pub batch_id: i64,
    /// One tracking info per broadcasting unit in the wave.
    pub waves: Vec<TrackingInfo>,
    /// True exactly when every contained wave reports complete.
    pub ready_to_advance: bool,
}

impl BatchRecord {
    fn new(batch_id: i64, info: TrackingInfo) -> Self {
        Self {
            batch_id,
            waves: vec![info],
            ready_to_advance: false,
        }
    }

    fn is_fully_complete(&self) -> bool {
        self.waves.iter().all(TrackingInfo::is_complete)
    }
}

/// Pure propagation bookkeeping: decides when a barrier, commit or recovery
/// wave has propagated through every fan-out path of the graph.
#[derive(Debug, Default)]
pub struct BatchTracker {
    barrier_records: HashMap<i64, BatchRecord>,
    commit_records: HashMap<i64, BatchRecord>,
    recovery_records: HashMap<i64, BatchRecord>,
    completed_batches: HashSet<i64>,
    committed_batches: HashSet<i64>,
}

impl BatchTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn track(
        records: &mut HashMap<i64, BatchRecord>,
        finalized: Option<&HashSet<i64>>,
        msg: &Message,
    ) -> Result<(), TrackerError> {
        let info = msg
            .tracking
            .clone()
            .ok_or(TrackerError::MissingTracking(msg.batch_id))?;
        if let Some(record) = records.get_mut(&msg.batch_id) {
            record.waves.push(info);
            return Ok(());
        }
        if let Some(finalized) = finalized {
            if msg.batch_id < 0 {
                return Err(TrackerError::NegativeBatch(msg.batch_id));
            }
            if finalized.contains(&msg.batch_id) {
                return Err(TrackerError::AlreadyFinalized(msg.batch_id));
            }
        }
        records.insert(msg.batch_id, BatchRecord::new(msg.batch_id, info));
        Ok(())
    }

    fn complete(
        records: &mut HashMap<i64, BatchRecord>,
        batch_id: i64,
        id: &UnitId,
    ) -> Result<Option<i64>, TrackerError> {
        let record = records
            .get_mut(&batch_id)
            .ok_or(TrackerError::UnknownBatch(batch_id))?;
        let info = record
            .waves
            .iter_mut()
            .find(|w| w.id == *id)
            .ok_or_else(|| TrackerError::UnknownWave {
                batch_id,
                id: id.clone(),
            })?;
        if info.completed >= info.expected {
            return Err(TrackerError::OverComplete {
                batch_id,
                id: id.clone(),
            });
        }
        info.completed += 1;
        if record.is_fully_complete() {
            record.ready_to_advance = true;
            records.remove(&batch_id);
            return Ok(Some(batch_id));
        }
        Ok(None)
    }

    /// Registers one hop of a barrier wave. Appends to the active record, or
    /// creates one if the batch is non-negative and not yet finalized.
    pub fn track_barrier(&mut self, msg: &Message) -> Result<(), TrackerError> {
        Self::track(&mut self.barrier_records, Some(&self.completed_batches), msg)
    }

    /// Registers one hop of a commit wave; symmetric to [`Self::track_barrier`].
    pub fn track_commit(&mut self, msg: &Message) -> Result<(), TrackerError> {
        Self::track(&mut self.commit_records, Some(&self.committed_batches), msg)
    }

    /// Registers one hop of a recovery wave. Recovery targets may be negative
    /// (`-1` means "nothing committed yet") and have no finalized set.
    pub fn track_recovery(&mut self, msg: &Message) -> Result<(), TrackerError> {
        Self::track(&mut self.recovery_records, None, msg)
    }

    /// Records one downstream acknowledgement of the barrier broadcast by
    /// `id` in `batch_id`. When the whole record becomes complete the batch
    /// moves into the finalized set, the record is dropped, and the batch id
    /// is returned so the caller can start the commit phase.
    pub fn complete_one_operator_barrier(
        &mut self,
        batch_id: i64,
        id: &UnitId,
    ) -> Result<Option<i64>, TrackerError> {
        let done = Self::complete(&mut self.barrier_records, batch_id, id)?;
        if let Some(batch) = done {
            self.completed_batches.insert(batch);
        }
        Ok(done)
    }

    /// Commit-side counterpart of [`Self::complete_one_operator_barrier`];
    /// full completion moves the batch into the committed set.
    pub fn complete_one_operator_commit(
        &mut self,
        batch_id: i64,
        id: &UnitId,
    ) -> Result<Option<i64>, TrackerError> {
        let done = Self::complete(&mut self.commit_records, batch_id, id)?;
        if let Some(batch) = done {
            self.committed_batches.insert(batch);
        }
        Ok(done)
    }

    /// Recovery-side acknowledgement; full completion returns the rollback
    /// target so the source replay can be triggered.
    pub fn complete_one_operator_recovery(
        &mut self,
        batch_id: i64,
        id: &UnitId,
    ) -> Result<Option<i64>, TrackerError> {
        Self::complete(&mut self.recovery_records, batch_id, id)
    }

    /// True once the barrier wave for the batch has fully propagated.
    /// Idempotent membership query; never changes state.
    pub fn is_ready_for_commit(&self, batch_id: i64) -> bool {
        self.completed_batches.contains(&batch_id)
    }

    /// True once the commit wave for the batch has fully propagated.
    pub fn is_commit_success(&self, batch_id: i64) -> bool {
        self.committed_batches.contains(&batch_id)
    }

    /// Clears the active barrier map only, so barrier alignment restarts
    /// cleanly after a rollback. Commit bookkeeping and the finalized sets
    /// are untouched.
    pub fn clean_up_on_recovery(&mut self) {
        self.barrier_records.clear();
    }
}

/// Commands handled by the tracker actor.
#[derive(Debug)]
pub enum TrackerCommand {
    /// Register a barrier wave hop.
    TrackBarrier(Message),
    /// Register a commit wave hop.
    TrackCommit(Message),
    /// Register a recovery wave hop.
    TrackRecovery(Message),
    /// Acknowledge one recipient of a barrier broadcast.
    CompleteBarrier {
        /// Batch the acknowledgement is for.
        batch_id: i64,
        /// Unit whose broadcast is being acknowledged.
        id: UnitId,
    },
    /// Acknowledge one recipient of a commit broadcast.
    CompleteCommit {
        /// Batch the acknowledgement is for.
        batch_id: i64,
        /// Unit whose broadcast is being acknowledged.
        id: UnitId,
    },
    /// Acknowledge one recipient of a recovery broadcast.
    CompleteRecovery {
        /// Rollback target the acknowledgement is for.
        batch_id: i64,
        /// Unit whose broadcast is being acknowledged.
        id: UnitId,
    },
    /// Clear active barrier tracking ahead of a rollback.
    CleanUpOnRecovery,
    /// Query: has the barrier wave fully propagated?
    IsReadyForCommit {
        /// Batch to query.
        batch_id: i64,
        /// Reply channel.
        reply: oneshot::Sender<bool>,
    },
    /// Query: has the commit wave fully propagated?
    IsCommitSuccess {
        /// Batch to query.
        batch_id: i64,
        /// Reply channel.
        reply: oneshot::Sender<bool>,
    },
    /// Stop the tracker actor.
    Shutdown,
}

/// Cloneable handle to the tracker actor.
#[derive(Clone, Debug)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    async fn send(&self, command: TrackerCommand) -> Result<(), TrackerError> {
        self.tx.send(command).await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// Registers a barrier wave hop.
    pub async fn track_barrier(&self, msg: Message) -> Result<(), TrackerError> {
        self.send(TrackerCommand::TrackBarrier(msg)).await
    }

    /// Registers a commit wave hop.
    pub async fn track_commit(&self, msg: Message) -> Result<(), TrackerError> {
        self.send(TrackerCommand::TrackCommit(msg)).await
    }

    /// Registers a recovery wave hop.
    pub async fn track_recovery(&self, msg: Message) -> Result<(), TrackerError> {
        self.send(TrackerCommand::TrackRecovery(msg)).await
    }

    /// Acknowledges one recipient of a barrier broadcast.
    pub async fn complete_barrier(&self, batch_id: i64, id: UnitId) -> Result<(), TrackerError> {
        self.send(TrackerCommand::CompleteBarrier { batch_id, id }).await
    }

    /// Acknowledges one recipient of a commit broadcast.
    pub async fn complete_commit(&self, batch_id: i64, id: UnitId) -> Result<(), TrackerError> {
        self.send(TrackerCommand::CompleteCommit { batch_id, id }).await
    }

    /// Acknowledges one recipient of a recovery broadcast.
    pub async fn complete_recovery(&self, batch_id: i64, id: UnitId) -> Result<(), TrackerError> {
        self.send(TrackerCommand::CompleteRecovery { batch_id, id }).await
    }

    /// Clears active barrier tracking ahead of a rollback.
    pub async fn clean_up_on_recovery(&self) -> Result<(), TrackerError> {
        self.send(TrackerCommand::CleanUpOnRecovery).await
    }

    /// True once the barrier wave for the batch has fully propagated.
    pub async fn is_ready_for_commit(&self, batch_id: i64) -> Result<bool, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::IsReadyForCommit { batch_id, reply }).await?;
        rx.await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// True once the commit wave for the batch has fully propagated.
    pub async fn is_commit_success(&self, batch_id: i64) -> Result<bool, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::IsCommitSuccess { batch_id, reply }).await?;
        rx.await.map_err(|_| TrackerError::ChannelClosed)
    }

    /// Stops the tracker actor.
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        self.send(TrackerCommand::Shutdown).await
    }
}

/// Spawns the tracker actor. Wave-completion decisions flow to the given
/// coordinator handle: a completed barrier wave starts the commit phase, a
/// completed commit wave reports commit completion, a completed recovery
/// wave triggers the source replay.
pub fn spawn_tracker(coordinator: CoordinatorHandle) -> TrackerHandle {
    let (tx, mut rx) = mpsc::channel::<TrackerCommand>(256);
    tokio::spawn(async move {
        let mut tracker = BatchTracker::new();
        while let Some(command) = rx.recv().await {
            match command {
                TrackerCommand::TrackBarrier(msg) => {
                    if let Err(e) = tracker.track_barrier(&msg) {
                        error!(batch = msg.batch_id, %e, "barrier tracking rejected");
                    }
                }
                TrackerCommand::TrackCommit(msg) => {
                    if let Err(e) = tracker.track_commit(&msg) {
                        error!(batch = msg.batch_id, %e, "commit tracking rejected");
                    }
                }
                TrackerCommand::TrackRecovery(msg) => {
                    if let Err(e) = tracker.track_recovery(&msg) {
                        error!(batch = msg.batch_id, %e, "recovery tracking rejected");
                    }
                }
                TrackerCommand::CompleteBarrier { batch_id, id } => {
                    match tracker.complete_one_operator_barrier(batch_id, &id) {
                        Ok(Some(batch)) => {
                            debug!(batch, "barrier wave fully propagated");
                            if let Err(e) = coordinator.start_commit(batch).await {
                                error!(batch, %e, "failed to start commit");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!(batch = batch_id, unit = %id, %e, "barrier ack rejected"),
                    }
                }
                TrackerCommand::CompleteCommit { batch_id, id } => {
                    match tracker.complete_one_operator_commit(batch_id, &id) {
                        Ok(Some(batch)) => {
                            debug!(batch, "commit wave fully propagated");
                            if let Err(e) = coordinator.complete_commit(batch).await {
                                error!(batch, %e, "failed to report commit completion");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!(batch = batch_id, unit = %id, %e, "commit ack rejected"),
                    }
                }
                TrackerCommand::CompleteRecovery { batch_id, id } => {
                    match tracker.complete_one_operator_recovery(batch_id, &id) {
                        Ok(Some(batch)) => {
                            debug!(batch, "recovery wave fully propagated");
                            if let Err(e) = coordinator.replay_completed().await {
                                error!(batch, %e, "failed to trigger source replay");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!(batch = batch_id, unit = %id, %e, "recovery ack rejected"),
                    }
                }
                TrackerCommand::CleanUpOnRecovery => tracker.clean_up_on_recovery(),
                TrackerCommand::IsReadyForCommit { batch_id, reply } => {
                    let _ = reply.send(tracker.is_ready_for_commit(batch_id));
                }
                TrackerCommand::IsCommitSuccess { batch_id, reply } => {
                    let _ = reply.send(tracker.is_commit_success(batch_id));
                }
                TrackerCommand::Shutdown => break,
            }
        }
    });
    TrackerHandle { tx }
}
