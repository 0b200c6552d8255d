//! Stateless and stateful operator units.
//!
//! One struct serves both roles; the settings role gates whether a message
//! is mapped and re-partitioned (stateless) or reduced into the state table
//! with reverse/incremental logging (stateful). Control messages align
//! across every upstream edge before the unit acts, re-broadcasts, and
//! acknowledges the wave to the tracker.

use super::state::StateTable;
use super::{Disposition, ExecutionCore, UnitError};
use crate::functions::{Mapper, Reducer};
use crate::message::{Message, MessageKind, STATE_NOT_HERE, TrackingInfo, UnitId};
use crate::partitioning::partition_stateless;
use crate::persist::{LogRecord, RecordKind, StateLog, replay_records};
use crate::topology::{OperatorSettings, UnitRole};
use crate::tracker::TrackerHandle;
use crate::transport::{Envelope, QueryKind, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A stateless or stateful processing unit.
pub struct OperatorUnit {
    id: UnitId,
    settings: OperatorSettings,
    core: ExecutionCore,
    transport: Arc<dyn Transport>,
    tracker: TrackerHandle,
    replace_tx: mpsc::Sender<UnitId>,
    checkpoint_interval: i64,
    mapper: Box<dyn Mapper>,
    reducer: Box<dyn Reducer>,
    table: StateTable,
    log: Option<Box<dyn StateLog>>,
    /// Set when this instance was activated as a replacement for a failed
    /// unit; selects the failed-unit recovery path once, then clears.
    is_replacement: bool,
}

impl OperatorUnit {
    /// Creates an operator unit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: UnitId,
        settings: OperatorSettings,
        upstream_count: u32,
        transport: Arc<dyn Transport>,
        tracker: TrackerHandle,
        replace_tx: mpsc::Sender<UnitId>,
        checkpoint_interval: i64,
        mapper: Box<dyn Mapper>,
        reducer: Box<dyn Reducer>,
        log: Option<Box<dyn StateLog>>,
        is_replacement: bool,
    ) -> Self {
        Self {
            id,
            settings,
            core: ExecutionCore::new(upstream_count),
            transport,
            tracker,
            replace_tx,
            checkpoint_interval,
            mapper,
            reducer,
            table: StateTable::new(),
            log,
            is_replacement,
        }
    }

    /// The unit's identifier.
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// Runs the unit's actor loop until shutdown or mailbox closure.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        debug!(unit = %self.id, role = ?self.settings.role, "unit started");
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Data(msg) => {
                    if let Err(e) = self.execute(msg).await {
                        error!(unit = %self.id, %e, "message execution failed");
                    }
                }
                Envelope::Query { kind, reply } => {
                    let _ = reply.send(self.query(kind));
                }
                Envelope::Ping { reply } => {
                    let _ = reply.send(());
                }
                Envelope::Reconfigure(settings) => {
                    debug!(unit = %self.id, "settings updated");
                    self.settings = settings;
                }
                Envelope::Ingest { .. } => {
                    warn!(unit = %self.id, "operator units never receive direct client writes");
                }
                Envelope::Replay => {
                    warn!(unit = %self.id, "replay is a source-only operation");
                }
                Envelope::Shutdown => break,
            }
        }
        debug!(unit = %self.id, "unit stopped");
    }

    /// The shared execution state machine: buffer future batches, align
    /// control messages, fail on batch regression.
    pub async fn execute(&mut self, msg: Message) -> Result<(), UnitError> {
        let msg = match self.core.observe(msg)? {
            Disposition::Deliver(msg) => msg,
            Disposition::Buffered => return Ok(()),
        };
        match msg.kind {
            MessageKind::Normal => self.handle_normal(msg).await,
            MessageKind::Barrier => self.handle_barrier(msg).await,
            MessageKind::Commit => self.handle_commit(msg).await,
            MessageKind::Recovery => self.handle_recovery(msg).await,
        }
    }

    async fn handle_normal(&mut self, msg: Message) -> Result<(), UnitError> {
        let received = self.core.record_receipt(&msg.origin, msg.batch_id);
        if msg.edge_count != received {
            return Err(UnitError::DeliveryCountMismatch {
                origin: msg.origin,
                batch_id: msg.batch_id,
                claimed: msg.edge_count,
                received,
            });
        }

        let outputs: Vec<(String, i64)> = match self.settings.role {
            UnitRole::Stateless => self.mapper.map(&msg.key, msg.value),
            UnitRole::Stateful => {
                let post = self
                    .table
                    .apply(msg.batch_id, &msg.key, msg.value, self.reducer.as_ref());
                debug!(unit = %self.id, key = %msg.key, batch = msg.batch_id, post, "state updated");
                if self.settings.children.is_empty() {
                    return Ok(());
                }
                vec![(msg.key.clone(), msg.value)]
            }
            UnitRole::Source => {
                warn!(unit = %self.id, "source role on an operator unit");
                return Ok(());
            }
        };
        self.forward_partitioned(outputs, msg.batch_id).await
    }

    /// Partitions outgoing records among the children; an individual
    /// delivery failure is logged, the target is reported for replacement
    /// and that one message is dropped; consistency is restored at the
    /// next barrier or recovery cycle, not per message.
    async fn forward_partitioned(
        &mut self,
        outputs: Vec<(String, i64)>,
        batch_id: i64,
    ) -> Result<(), UnitError> {
        let targets = self.settings.child_ids();
        if targets.is_empty() {
            warn!(unit = %self.id, "no downstream targets configured, dropping output");
            return Ok(());
        }
        for (key, value) in outputs {
            let target = partition_stateless(&key, &targets)?.clone();
            let mut out = Message::normal(key, value, batch_id, self.id.clone());
            out.edge_count = self.core.next_edge_count(&target, batch_id);
            if let Err(e) = self.transport.publish(&target, Envelope::Data(out)).await {
                warn!(unit = %self.id, target = %target, %e, "delivery failed, requesting replacement");
                let _ = self.replace_tx.send(target.clone()).await;
            }
        }
        Ok(())
    }

    async fn handle_barrier(&mut self, msg: Message) -> Result<(), UnitError> {
        let batch_id = msg.batch_id;
        let info = msg
            .tracking
            .clone()
            .ok_or(UnitError::MissingTracking(batch_id))?;
        let aligned = self.core.control_arrived(
            MessageKind::Barrier,
            batch_id,
            msg.origin.clone(),
            info,
            msg.edge_count,
        );
        if !aligned {
            return Ok(());
        }

        let stashed = self.core.take_round(MessageKind::Barrier, batch_id);
        for (origin, _, claimed) in &stashed {
            let received = self.core.received_count(origin, batch_id);
            if *claimed != received {
                return Err(UnitError::DeliveryCountMismatch {
                    origin: origin.clone(),
                    batch_id,
                    claimed: *claimed,
                    received,
                });
            }
        }
        debug!(unit = %self.id, batch = batch_id, "barrier aligned");

        // Buffered messages of the next batch are released exactly once, in
        // original order, before the barrier moves on.
        let flushed = self.core.release_next(batch_id);
        for msg in flushed {
            self.handle_normal(msg).await?;
        }

        self.propagate_control(MessageKind::Barrier, batch_id).await?;
        for (_, info, _) in stashed {
            self.tracker.complete_barrier(batch_id, info.id).await?;
        }
        Ok(())
    }

    async fn handle_commit(&mut self, msg: Message) -> Result<(), UnitError> {
        let batch_id = msg.batch_id;
        if batch_id < self.core.current_batch_id {
            // A wave abandoned by an intervening recovery; there is no
            // cancellation of in-flight commits, late arrivals are dropped.
            warn!(unit = %self.id, batch = batch_id, current = self.core.current_batch_id, "stale commit dropped");
            return Ok(());
        }
        let info = msg
            .tracking
            .clone()
            .ok_or(UnitError::MissingTracking(batch_id))?;
        let aligned =
            self.core
                .control_arrived(MessageKind::Commit, batch_id, msg.origin.clone(), info, 0);
        if !aligned {
            return Ok(());
        }
        let stashed = self.core.take_round(MessageKind::Commit, batch_id);

        if self.settings.role == UnitRole::Stateful {
            let record = if batch_id % self.checkpoint_interval == 0 {
                LogRecord::new(batch_id, RecordKind::Checkpoint, self.table.snapshot())
            } else {
                LogRecord::new(
                    batch_id,
                    RecordKind::Incremental,
                    self.table.incremental_entries(batch_id),
                )
            };
            if let Some(log) = self.log.as_mut() {
                if let Err(e) = log.append(&record) {
                    error!(unit = %self.id, batch = batch_id, %e, "commit persistence failed");
                    return Err(e.into());
                }
            }
            self.table.discard_batch(batch_id);
        }

        self.core.advance_after_commit(batch_id);
        info!(unit = %self.id, batch = batch_id, "batch committed");

        self.propagate_control(MessageKind::Commit, batch_id).await?;
        for (_, info, _) in stashed {
            self.tracker.complete_commit(batch_id, info.id).await?;
        }
        Ok(())
    }

    async fn handle_recovery(&mut self, msg: Message) -> Result<(), UnitError> {
        let target = msg.batch_id;
        let info = msg
            .tracking
            .clone()
            .ok_or(UnitError::MissingTracking(target))?;
        let aligned =
            self.core
                .control_arrived(MessageKind::Recovery, target, msg.origin.clone(), info, 0);
        if !aligned {
            return Ok(());
        }
        let stashed = self.core.take_round(MessageKind::Recovery, target);

        if self.settings.role == UnitRole::Stateful {
            if target == -1 {
                // Nothing was ever committed: wipe everything.
                self.table.clear();
            } else if self.is_replacement {
                // Failed-unit path: rebuild from the durable log.
                let records = match self.log.as_ref().map(|log| log.read_all()).transpose() {
                    Ok(records) => records.unwrap_or_default(),
                    Err(e) => {
                        // State stays unchanged; an external retry is
                        // expected to re-issue the recovery wave.
                        error!(unit = %self.id, target, %e, "recovery replay failed");
                        return Ok(());
                    }
                };
                self.table.restore(replay_records(&records, target));
            } else {
                // Survivor path: undo uncommitted batches in memory.
                self.table.rollback(target);
            }
        }

        self.is_replacement = false;
        self.core.reset_for_recovery(target);
        info!(unit = %self.id, target, "recovered, resuming at batch {}", target + 1);

        self.propagate_control(MessageKind::Recovery, target).await?;
        for (_, info, _) in stashed {
            self.tracker.complete_recovery(target, info.id).await?;
        }
        Ok(())
    }

    /// Registers this unit's hop of the wave sized to its fan-out, then
    /// broadcasts the control message to every child. Registration precedes
    /// the broadcast so no downstream acknowledgement can reach the tracker
    /// before the hop exists; sinks register nothing and broadcast nothing.
    async fn propagate_control(&mut self, kind: MessageKind, batch_id: i64) -> Result<(), UnitError> {
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
                out.edge_count = self.core.sent_count(child, batch_id);
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

    /// Observable query surface; absent data answers with a sentinel.
    pub fn query(&self, kind: QueryKind) -> i64 {
        match kind {
            QueryKind::State(key) => match self.settings.role {
                UnitRole::Stateful => self.table.get(&key),
                _ => STATE_NOT_HERE,
            },
            QueryKind::ReverseLog { key, batch } => match self.settings.role {
                UnitRole::Stateful => self
                    .table
                    .reverse_image(batch.unwrap_or(self.core.current_batch_id), &key),
                _ => STATE_NOT_HERE,
            },
            QueryKind::IncrementalLog { key, batch } => match self.settings.role {
                UnitRole::Stateful => self
                    .table
                    .incremental_image(batch.unwrap_or(self.core.current_batch_id), &key),
                _ => STATE_NOT_HERE,
            },
            QueryKind::CurrentBatch => self.core.current_batch_id,
        }
    }
}
