//! Batch coordinator.
//!
//! Drives the repeating barrier timer, starts the commit phase when the
//! tracker reports a fully propagated barrier wave, and owns recovery
//! initiation: pause the timer, broadcast the rollback target, instruct the
//! tracker to clear barrier state, resume the timer. The coordinator never
//! decides on its own when to recover; that call comes from an external
//! supervisory signal.
//!
//! Every canonical control message leaves through the source unit and is
//! registered with the tracker before it is published, so the acknowledgement
//! tree is rooted at the coordinator.

use crate::message::{Message, MessageKind, TrackingInfo, UnitId};
use crate::tracker::TrackerHandle;
use crate::transport::{Envelope, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Error type for coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator actor is gone.
    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// Commands handled by the coordinator actor.
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// Begin the repeating barrier timer.
    StartTimer,
    /// Emit one barrier now (timer tick or test hook).
    Tick,
    /// Start the commit phase for a fully propagated batch. Invoked only by
    /// the tracker.
    StartCommit(i64),
    /// A commit wave has fully propagated; bookkeeping only.
    CompleteCommit(i64),
    /// Pause the timer, broadcast the rollback target, clear barrier
    /// tracking, resume the timer.
    StartRecovery,
    /// A recovery wave has fully propagated; tell the source to replay.
    ReplayCompleted,
    /// Snapshot of the coordinator's counters.
    Status {
        /// Reply channel.
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    /// Stop the actor and its timer.
    Shutdown,
}

/// Queryable snapshot of the coordinator's counters.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorStatus {
    /// Next barrier identifier to assign.
    pub current_batch_id: i64,
    /// Highest batch a commit was started for; `-1` means nothing committed.
    pub committed_batch_id: i64,
    /// Highest batch whose commit wave fully propagated; `-1` initially.
    pub last_completed_commit: i64,
}

/// Cloneable handle to the coordinator actor.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Creates the command channel ahead of spawning the actor, so the
    /// tracker and the coordinator can hold each other's handles.
    pub fn channel() -> (Self, mpsc::Receiver<CoordinatorCommand>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    async fn send(&self, command: CoordinatorCommand) -> Result<(), CoordinatorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Begins the repeating barrier timer.
    pub async fn start_barrier_timer(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::StartTimer).await
    }

    /// Emits one barrier immediately.
    pub async fn tick_now(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::Tick).await
    }

    /// Starts the commit phase for a batch.
    pub async fn start_commit(&self, batch_id: i64) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::StartCommit(batch_id)).await
    }

    /// Reports that a commit wave fully propagated.
    pub async fn complete_commit(&self, batch_id: i64) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::CompleteCommit(batch_id)).await
    }

    /// Initiates recovery to the highest committed batch.
    pub async fn start_recovery(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::StartRecovery).await
    }

    /// Reports that a recovery wave fully propagated.
    pub async fn replay_completed(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::ReplayCompleted).await
    }

    /// Fetches the coordinator's counters.
    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(CoordinatorCommand::Status { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Highest batch a commit was started for; `-1` means nothing committed.
    pub async fn committed_batch_id(&self) -> Result<i64, CoordinatorError> {
        Ok(self.status().await?.committed_batch_id)
    }

    /// Stops the actor.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::Shutdown).await
    }
}

/// The coordinator actor state.
pub struct BatchCoordinator {
    id: UnitId,
    source: UnitId,
    transport: Arc<dyn Transport>,
    tracker: TrackerHandle,
    barrier_interval: Duration,
    self_handle: CoordinatorHandle,
    current_batch_id: i64,
    committed_batch_id: i64,
    last_completed_commit: i64,
    timer: Option<JoinHandle<()>>,
}

impl BatchCoordinator {
    /// Creates a coordinator that emits control messages through `source`.
    /// `self_handle` must wrap the sender paired with the receiver passed to
    /// [`Self::spawn`]; the timer task ticks through it.
    pub fn new(
        id: UnitId,
        source: UnitId,
        transport: Arc<dyn Transport>,
        tracker: TrackerHandle,
        barrier_interval: Duration,
        self_handle: CoordinatorHandle,
    ) -> Self {
        Self {
            id,
            source,
            transport,
            tracker,
            barrier_interval,
            self_handle,
            current_batch_id: 0,
            committed_batch_id: -1,
            last_completed_commit: -1,
            timer: None,
        }
    }

    /// Runs the actor loop on a spawned task.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<CoordinatorCommand>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    CoordinatorCommand::StartTimer => self.start_timer(),
                    CoordinatorCommand::Tick => self.emit_barrier().await,
                    CoordinatorCommand::StartCommit(batch) => self.start_commit(batch).await,
                    CoordinatorCommand::CompleteCommit(batch) => {
                        self.last_completed_commit = batch;
                        info!(batch, "commit wave completed");
                    }
                    CoordinatorCommand::StartRecovery => self.start_recovery().await,
                    CoordinatorCommand::ReplayCompleted => {
                        info!(target_batch = self.committed_batch_id, "recovery wave completed, replaying source buffer");
                        if let Err(e) = self.transport.publish(&self.source, Envelope::Replay).await {
                            warn!(%e, "failed to trigger source replay");
                        }
                    }
                    CoordinatorCommand::Status { reply } => {
                        let _ = reply.send(CoordinatorStatus {
                            current_batch_id: self.current_batch_id,
                            committed_batch_id: self.committed_batch_id,
                            last_completed_commit: self.last_completed_commit,
                        });
                    }
                    CoordinatorCommand::Shutdown => break,
                }
            }
            if let Some(timer) = self.timer.take() {
                timer.abort();
            }
        })
    }

    fn start_timer(&mut self) {
        if self.timer.is_some() {
            return;
        }
        let handle = self.self_handle.clone();
        let period = self.barrier_interval;
        self.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if handle.tick_now().await.is_err() {
                    break;
                }
            }
        }));
        info!(period_ms = self.barrier_interval.as_millis() as u64, "barrier timer started");
    }

    /// Stamps the canonical barrier with the next batch id and sends it
    /// through the source, registering the wave root first.
    async fn emit_barrier(&mut self) {
        let batch = self.current_batch_id;
        let msg = Message::control(
            MessageKind::Barrier,
            batch,
            self.id.clone(),
            TrackingInfo::new(self.id.clone(), 1),
        );
        if let Err(e) = self.tracker.track_barrier(msg.clone()).await {
            warn!(batch, %e, "failed to register barrier wave root");
            return;
        }
        if let Err(e) = self.transport.publish(&self.source, Envelope::Data(msg)).await {
            warn!(batch, %e, "failed to emit barrier through source");
            return;
        }
        info!(batch, "barrier emitted");
        self.current_batch_id += 1;
    }

    async fn start_commit(&mut self, batch: i64) {
        self.committed_batch_id = batch;
        let msg = Message::control(
            MessageKind::Commit,
            batch,
            self.id.clone(),
            TrackingInfo::new(self.id.clone(), 1),
        );
        if let Err(e) = self.tracker.track_commit(msg.clone()).await {
            warn!(batch, %e, "failed to register commit wave root");
            return;
        }
        if let Err(e) = self.transport.publish(&self.source, Envelope::Data(msg)).await {
            warn!(batch, %e, "failed to emit commit through source");
            return;
        }
        info!(batch, "commit started");
    }

    /// The engine's sole failure-recovery entry point: pause the timer,
    /// broadcast the rollback target, clear barrier tracking, resume.
    async fn start_recovery(&mut self) {
        let was_running = self.timer.is_some();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let target = self.committed_batch_id;
        // Barrier numbering resumes right after the rollback target so the
        // re-processed batches are barriered and committed again.
        self.current_batch_id = target + 1;
        info!(target, "recovery started");
        let msg = Message::control(
            MessageKind::Recovery,
            target,
            self.id.clone(),
            TrackingInfo::new(self.id.clone(), 1),
        );
        if let Err(e) = self.tracker.track_recovery(msg.clone()).await {
            warn!(target, %e, "failed to register recovery wave root");
        } else if let Err(e) = self.transport.publish(&self.source, Envelope::Data(msg)).await {
            warn!(target, %e, "failed to broadcast recovery through source");
        }

        if let Err(e) = self.tracker.clean_up_on_recovery().await {
            warn!(%e, "failed to clear barrier tracking");
        }

        if was_running {
            self.start_timer();
        }
    }
}
