//! Source unit: the engine's ingress point.
//!
//! Assigns batch identifiers to ordinary messages at production time,
//! retains produced messages for post-recovery replay, and roots every
//! control wave below the coordinator: for each barrier, commit or recovery
//! message it constructs tracking info sized to its immediate fan-out,
//! registers it, and broadcasts with per-edge delivery counts attached.

use crate::message::{Message, MessageKind, STATE_NOT_HERE, TrackingInfo, UnitId};
use crate::partitioning::partition_stateless;
use crate::topology::OperatorSettings;
use crate::tracker::TrackerHandle;
use crate::transport::{Envelope, QueryKind, Transport};
use crate::unit::UnitError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The ingress unit.
pub struct SourceUnit {
    id: UnitId,
    settings: OperatorSettings,
    transport: Arc<dyn Transport>,
    tracker: TrackerHandle,
    replace_tx: mpsc::Sender<UnitId>,
    /// Batch stamped onto the next ingested message.
    current_batch_id: i64,
    /// Highest committed batch; retained messages at or below it are pruned.
    committed_batch_id: i64,
    sent: HashMap<(UnitId, i64), u64>,
    /// Produced but uncommitted messages, in production order, for replay.
    retained: Vec<Message>,
}

impl SourceUnit {
    /// Creates a source unit.
    pub fn new(
        id: UnitId,
        settings: OperatorSettings,
        transport: Arc<dyn Transport>,
        tracker: TrackerHandle,
        replace_tx: mpsc::Sender<UnitId>,
    ) -> Self {
        Self {
            id,
            settings,
            transport,
            tracker,
            replace_tx,
            current_batch_id: 0,
            committed_batch_id: -1,
            sent: HashMap::new(),
            retained: Vec::new(),
        }
    }

    /// Runs the source's actor loop until shutdown or mailbox closure.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        debug!(unit = %self.id, "source started");
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Ingest { key, value } => {
                    if let Err(e) = self.ingest(key, value).await {
                        error!(unit = %self.id, %e, "ingest failed");
                    }
                }
                Envelope::Data(msg) => {
                    if let Err(e) = self.handle_control(msg).await {
                        error!(unit = %self.id, %e, "control handling failed");
                    }
                }
                Envelope::Replay => {
                    if let Err(e) = self.replay_on_recovery_completed().await {
                        error!(unit = %self.id, %e, "replay failed");
                    }
                }
                Envelope::Query { kind, reply } => {
                    let _ = reply.send(self.answer(kind));
                }
                Envelope::Ping { reply } => {
                    let _ = reply.send(());
                }
                Envelope::Reconfigure(settings) => {
                    debug!(unit = %self.id, "settings updated");
                    self.settings = settings;
                }
                Envelope::Shutdown => break,
            }
        }
        debug!(unit = %self.id, "source stopped");
    }

    /// Stamps a client record with the current batch, retains it for replay
    /// and routes it by partition to one downstream unit.
    async fn ingest(&mut self, key: String, value: i64) -> Result<(), UnitError> {
        let msg = Message::normal(key, value, self.current_batch_id, self.id.clone());
        self.retained.push(msg.clone());
        self.route(msg).await
    }

    async fn route(&mut self, mut msg: Message) -> Result<(), UnitError> {
        let targets = self.settings.child_ids();
        let target = partition_stateless(&msg.key, &targets)?.clone();
        let count = self.sent.entry((target.clone(), msg.batch_id)).or_insert(0);
        *count += 1;
        msg.edge_count = *count;
        if let Err(e) = self.transport.publish(&target, Envelope::Data(msg)).await {
            warn!(unit = %self.id, target = %target, %e, "delivery failed, requesting replacement");
            let _ = self.replace_tx.send(target).await;
        }
        Ok(())
    }

    async fn handle_control(&mut self, msg: Message) -> Result<(), UnitError> {
        let batch_id = msg.batch_id;
        let info = msg
            .tracking
            .clone()
            .ok_or(UnitError::MissingTracking(batch_id))?;
        match msg.kind {
            MessageKind::Barrier => {
                if batch_id != self.current_batch_id {
                    warn!(unit = %self.id, batch = batch_id, current = self.current_batch_id, "barrier out of step with source batch");
                }
                self.broadcast(MessageKind::Barrier, batch_id).await?;
                self.tracker.complete_barrier(batch_id, info.id).await?;
                // The barrier closes its batch; production continues in the next.
                self.current_batch_id = batch_id + 1;
            }
            MessageKind::Commit => {
                self.committed_batch_id = batch_id;
                self.retained.retain(|m| m.batch_id > batch_id);
                self.sent.retain(|(_, b), _| *b > batch_id);
                self.broadcast(MessageKind::Commit, batch_id).await?;
                self.tracker.complete_commit(batch_id, info.id).await?;
            }
            MessageKind::Recovery => {
                let target = batch_id;
                self.current_batch_id = target + 1;
                self.sent.retain(|(_, b), _| *b <= target);
                info!(unit = %self.id, target, retained = self.retained.len(), "source rolled back");
                self.broadcast(MessageKind::Recovery, target).await?;
                self.tracker.complete_recovery(target, info.id).await?;
            }
            MessageKind::Normal => {
                warn!(unit = %self.id, "source received a normal message from the transport");
            }
        }
        Ok(())
    }

    /// Registers this hop of the wave sized to the source's fan-out and
    /// broadcasts to every child; barriers carry the per-edge delivery claim.
    async fn broadcast(&mut self, kind: MessageKind, batch_id: i64) -> Result<(), UnitError> {
        let children = self.settings.child_ids();
        if children.is_empty() {
            return Ok(());
        }
        let own = TrackingInfo::new(self.id.clone(), children.len() as u32);
        let template = Message::control(kind, batch_id, self.id.clone(), own);
        match kind {
            MessageKind::Barrier => self.tracker.track_barrier(template.clone()).await?,
            MessageKind::Commit => self.tracker.track_commit(template.clone()).await?,
            MessageKind::Recovery => self.tracker.track_recovery(template.clone()).await?,
            MessageKind::Normal => {}
        }

        let mut outgoing = Vec::with_capacity(children.len());
        for child in &children {
            let mut out = template.clone();
            if kind == MessageKind::Barrier {
                out.edge_count = self
                    .sent
                    .get(&(child.clone(), batch_id))
                    .copied()
                    .unwrap_or(0);
            }
            outgoing.push(self.transport.publish(child, Envelope::Data(out)));
        }
        let results = futures::future::join_all(outgoing).await;
        for (child, result) in children.iter().zip(results) {
            if let Err(e) = result {
                warn!(unit = %self.id, target = %child, %e, "control delivery failed, requesting replacement");
                let _ = self.replace_tx.send(child.clone()).await;
            }
        }
        Ok(())
    }

    /// Re-drains the retained buffer through the normal routing path after a
    /// completed recovery wave, re-stamped to the current batch.
    async fn replay_on_recovery_completed(&mut self) -> Result<(), UnitError> {
        let pending = std::mem::take(&mut self.retained);
        info!(unit = %self.id, count = pending.len(), batch = self.current_batch_id, "replaying retained messages");
        for old in pending {
            let msg = Message::normal(old.key, old.value, self.current_batch_id, self.id.clone());
            self.retained.push(msg.clone());
            self.route(msg).await?;
        }
        Ok(())
    }

    fn answer(&self, kind: QueryKind) -> i64 {
        match kind {
            QueryKind::CurrentBatch => self.current_batch_id,
            // The source holds no keyed state.
            _ => STATE_NOT_HERE,
        }
    }
}
