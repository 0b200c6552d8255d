//! Engine bootstrap and observable surface.
//!
//! Builds the source → stateless → stateful topology, registers every unit's
//! mailbox with the in-process transport, spawns the unit actors, the
//! tracker, the coordinator and the error detector, and wires every handle
//! explicitly. There are no global named singletons; well-known identifiers
//! are resolved once here.
//!
//! The replacement manager owns the topology graph: units and the detector
//! request replacement over a channel, the manager rewires the graph, spawns
//! the fresh unit (flagged for failed-unit recovery) and pushes updated
//! settings snapshots to the affected upstream units.

use crate::config::EngineConfig;
use crate::coordinator::{BatchCoordinator, CoordinatorError, CoordinatorHandle};
use crate::detector::{ErrorDetector, ErrorDetectorConfig};
use crate::functions::{CountReducer, IdentityMapper, Mapper, Reducer};
use crate::message::UnitId;
use crate::persist::{FileStateLog, MemoryStateLog, PersistError, StateLog};
use crate::topology::{OperatorSettings, TopologyError, TopologyGraph, TopologyUnit, UnitRole};
use crate::tracker::{TrackerError, TrackerHandle, spawn_tracker};
use crate::transport::{Envelope, LocalTransport, QueryKind, Transport, TransportError, query_unit};
use crate::unit::operator::OperatorUnit;
use crate::unit::source::SourceUnit;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Error type for engine bootstrap and queries.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Topology construction failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Transport interaction failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Tracker interaction failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Coordinator interaction failed.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    /// Durable log setup failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The engine's background tasks are gone.
    #[error("engine stopped")]
    Stopped,
}

/// Factory for the stateless tier's mapper instances.
pub type MapperFactory = Arc<dyn Fn() -> Box<dyn Mapper> + Send + Sync>;
/// Factory for the stateful tier's reducer instances.
pub type ReducerFactory = Arc<dyn Fn() -> Box<dyn Reducer> + Send + Sync>;

/// Everything needed to activate a unit, shared between bootstrap and the
/// replacement manager.
struct UnitSpawner {
    transport: Arc<LocalTransport>,
    tracker: TrackerHandle,
    replace_tx: mpsc::Sender<UnitId>,
    checkpoint_interval: i64,
    mapper_factory: MapperFactory,
    reducer_factory: ReducerFactory,
}

impl UnitSpawner {
    async fn spawn_unit(
        &self,
        unit: &TopologyUnit,
        is_replacement: bool,
    ) -> Result<(), EngineError> {
        let rx = self.transport.register(unit.id.clone()).await;
        let transport: Arc<dyn Transport> = self.transport.clone();
        match unit.role {
            UnitRole::Source => {
                let source = SourceUnit::new(
                    unit.id.clone(),
                    unit.settings.clone(),
                    transport,
                    self.tracker.clone(),
                    self.replace_tx.clone(),
                );
                tokio::spawn(source.run(rx));
            }
            UnitRole::Stateless | UnitRole::Stateful => {
                let log: Option<Box<dyn StateLog>> = if unit.role == UnitRole::Stateful {
                    let log: Box<dyn StateLog> = match &unit.settings.log_path {
                        Some(path) => Box::new(FileStateLog::new(path)?),
                        None => Box::new(MemoryStateLog::new()),
                    };
                    Some(log)
                } else {
                    None
                };
                let upstream_count = unit.upstream.len().max(1) as u32;
                let operator = OperatorUnit::new(
                    unit.id.clone(),
                    unit.settings.clone(),
                    upstream_count,
                    transport,
                    self.tracker.clone(),
                    self.replace_tx.clone(),
                    self.checkpoint_interval,
                    (self.mapper_factory)(),
                    (self.reducer_factory)(),
                    log,
                    is_replacement,
                );
                tokio::spawn(operator.run(rx));
            }
        }
        Ok(())
    }
}

/// A running engine instance.
pub struct Engine {
    transport: Arc<LocalTransport>,
    topology: Arc<Mutex<TopologyGraph>>,
    tracker: TrackerHandle,
    coordinator: CoordinatorHandle,
    source_id: UnitId,
    replace_tx: mpsc::Sender<UnitId>,
    detector_task: JoinHandle<()>,
    manager_task: JoinHandle<()>,
}

impl Engine {
    /// Starts an engine with the word-count deployment: identity mapping in
    /// the stateless tier, counting reduction in the stateful tier.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start_with(
            config,
            Arc::new(|| Box::new(IdentityMapper) as Box<dyn Mapper>),
            Arc::new(|| Box::new(CountReducer) as Box<dyn Reducer>),
        )
        .await
    }

    /// Starts an engine with custom processing functions.
    pub async fn start_with(
        config: EngineConfig,
        mapper_factory: MapperFactory,
        reducer_factory: ReducerFactory,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;

        let transport = Arc::new(LocalTransport::new());
        let source_id = UnitId::from("source-0");
        let coordinator_id = UnitId::from("coordinator");

        let mut graph = TopologyGraph::new();
        graph.add_unit(TopologyUnit::new(
            source_id.clone(),
            UnitRole::Source,
            OperatorSettings::new(UnitRole::Source),
        ))?;
        let stateless_ids: Vec<UnitId> = (0..config.stateless_units)
            .map(|i| UnitId::new(format!("stateless-{i}")))
            .collect();
        let stateful_ids: Vec<UnitId> = (0..config.stateful_units)
            .map(|i| UnitId::new(format!("stateful-{i}")))
            .collect();
        for id in &stateless_ids {
            graph.add_unit(TopologyUnit::new(
                id.clone(),
                UnitRole::Stateless,
                OperatorSettings::new(UnitRole::Stateless),
            ))?;
        }
        for id in &stateful_ids {
            let mut settings = OperatorSettings::new(UnitRole::Stateful);
            if let Some(dir) = &config.log_dir {
                settings = settings.with_log_path(dir.join(format!("{}.log", id.as_str())));
            }
            graph.add_unit(TopologyUnit::new(id.clone(), UnitRole::Stateful, settings))?;
        }

        // Source fans out to the stateless tier; each stateless unit
        // partitions among every stateful unit. Without a stateless tier the
        // source feeds the stateful units directly.
        let source_children: &[UnitId] = if stateless_ids.is_empty() {
            &stateful_ids
        } else {
            &stateless_ids
        };
        for child in source_children {
            graph.connect(&source_id, child)?;
        }
        for stateless in &stateless_ids {
            for stateful in &stateful_ids {
                graph.connect(stateless, stateful)?;
            }
        }

        let (coordinator, coordinator_rx) = CoordinatorHandle::channel();
        let tracker = spawn_tracker(coordinator.clone());
        BatchCoordinator::new(
            coordinator_id,
            source_id.clone(),
            transport.clone(),
            tracker.clone(),
            config.barrier_interval,
            coordinator.clone(),
        )
        .spawn(coordinator_rx);

        let (replace_tx, replace_rx) = mpsc::channel(64);
        let spawner = UnitSpawner {
            transport: transport.clone(),
            tracker: tracker.clone(),
            replace_tx: replace_tx.clone(),
            checkpoint_interval: config.checkpoint_interval,
            mapper_factory,
            reducer_factory,
        };
        for id in graph.all_units() {
            if let Some(unit) = graph.get(&id).cloned() {
                spawner.spawn_unit(&unit, false).await?;
            }
        }

        let topology = Arc::new(Mutex::new(graph));
        let manager_task = Self::spawn_replacement_manager(topology.clone(), spawner, replace_rx);
        let detector_task = ErrorDetector::new(
            topology.clone(),
            transport.clone(),
            replace_tx.clone(),
            ErrorDetectorConfig {
                probe_interval: config.probe_interval,
                probe_timeout: config.probe_timeout,
            },
        )
        .spawn();

        info!(
            stateless = config.stateless_units,
            stateful = config.stateful_units,
            "engine started"
        );
        Ok(Self {
            transport,
            topology,
            tracker,
            coordinator,
            source_id,
            replace_tx,
            detector_task,
            manager_task,
        })
    }

    fn spawn_replacement_manager(
        topology: Arc<Mutex<TopologyGraph>>,
        spawner: UnitSpawner,
        mut replace_rx: mpsc::Receiver<UnitId>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(failed) = replace_rx.recv().await {
                let mut graph = topology.lock().await;
                if graph.get(&failed).is_none() {
                    // Already replaced by an earlier report.
                    continue;
                }
                let new_id = match graph.replace_unit(&failed) {
                    Ok(id) => id,
                    Err(e) => {
                        error!(unit = %failed, %e, "replacement failed");
                        continue;
                    }
                };
                spawner.transport.deregister(&failed).await;
                let Some(unit) = graph.get(&new_id).cloned() else {
                    continue;
                };
                if let Err(e) = spawner.spawn_unit(&unit, true).await {
                    error!(unit = %new_id, %e, "failed to activate replacement");
                    continue;
                }
                // Upstream units route by their settings snapshot; push the
                // rewired registry to them.
                for up in &unit.upstream {
                    if let Some(upstream) = graph.get(up) {
                        let _ = spawner
                            .transport
                            .publish(up, Envelope::Reconfigure(upstream.settings.clone()))
                            .await;
                    }
                }
                info!(failed = %failed, replacement = %new_id, "unit replaced");
            }
        })
    }

    /// Hands a client record to the source for batch assignment and routing.
    pub async fn ingest(&self, key: impl Into<String>, value: i64) -> Result<(), EngineError> {
        self.transport
            .publish(
                &self.source_id,
                Envelope::Ingest {
                    key: key.into(),
                    value,
                },
            )
            .await?;
        Ok(())
    }

    /// Begins the repeating barrier timer.
    pub async fn start_barrier_timer(&self) -> Result<(), EngineError> {
        self.coordinator.start_barrier_timer().await?;
        Ok(())
    }

    /// Emits one barrier immediately (test hook; production uses the timer).
    pub async fn emit_barrier(&self) -> Result<(), EngineError> {
        self.coordinator.tick_now().await?;
        Ok(())
    }

    /// Initiates rollback to the highest committed batch.
    pub async fn start_recovery(&self) -> Result<(), EngineError> {
        self.coordinator.start_recovery().await?;
        Ok(())
    }

    /// Requests replacement of a unit, as if the detector had flagged it.
    pub async fn replace_unit(&self, id: UnitId) -> Result<(), EngineError> {
        self.replace_tx
            .send(id)
            .await
            .map_err(|_| EngineError::Stopped)
    }

    /// Current value for a key on a specific unit; sentinel when absent.
    pub async fn get_state(&self, unit: &UnitId, key: &str) -> Result<i64, EngineError> {
        Ok(query_unit(self.transport.as_ref(), unit, QueryKind::State(key.to_string())).await?)
    }

    /// Current value for a key on whichever stateful unit owns it by
    /// partition, resolved against the live topology.
    pub async fn lookup_state(&self, key: &str) -> Result<i64, EngineError> {
        let owner = {
            let graph = self.topology.lock().await;
            let stateful: Vec<UnitId> = graph
                .all_units()
                .into_iter()
                .filter(|id| graph.get(id).map(|u| u.role == UnitRole::Stateful).unwrap_or(false))
                .collect();
            match crate::partitioning::partition_stateless(key, &stateful) {
                Ok(id) => id.clone(),
                Err(_) => return Ok(crate::message::STATE_NOT_FOUND),
            }
        };
        self.get_state(&owner, key).await
    }

    /// Pre-image for a key in a unit's reverse log; `None` batch means the
    /// unit's current batch.
    pub async fn get_state_in_reverse_log(
        &self,
        unit: &UnitId,
        key: &str,
        batch: Option<i64>,
    ) -> Result<i64, EngineError> {
        Ok(query_unit(
            self.transport.as_ref(),
            unit,
            QueryKind::ReverseLog {
                key: key.to_string(),
                batch,
            },
        )
        .await?)
    }

    /// Post-image for a key in a unit's incremental log; `None` batch means
    /// the unit's current batch.
    pub async fn get_state_in_incremental_log(
        &self,
        unit: &UnitId,
        key: &str,
        batch: Option<i64>,
    ) -> Result<i64, EngineError> {
        Ok(query_unit(
            self.transport.as_ref(),
            unit,
            QueryKind::IncrementalLog {
                key: key.to_string(),
                batch,
            },
        )
        .await?)
    }

    /// The batch a unit is currently processing.
    pub async fn current_batch(&self, unit: &UnitId) -> Result<i64, EngineError> {
        Ok(query_unit(self.transport.as_ref(), unit, QueryKind::CurrentBatch).await?)
    }

    /// True once the barrier wave for the batch has fully propagated.
    pub async fn is_ready_for_commit(&self, batch_id: i64) -> Result<bool, EngineError> {
        Ok(self.tracker.is_ready_for_commit(batch_id).await?)
    }

    /// True once the commit wave for the batch has fully propagated.
    pub async fn is_commit_success(&self, batch_id: i64) -> Result<bool, EngineError> {
        Ok(self.tracker.is_commit_success(batch_id).await?)
    }

    /// Polls commit success until it holds or the timeout elapses.
    pub async fn await_commit(&self, batch_id: i64, timeout: Duration) -> Result<bool, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_commit_success(batch_id).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Highest batch a commit was started for; `-1` means nothing committed.
    pub async fn committed_batch_id(&self) -> Result<i64, EngineError> {
        Ok(self.coordinator.committed_batch_id().await?)
    }

    /// Number of units in the topology.
    pub async fn topology_size(&self) -> usize {
        self.topology.lock().await.len()
    }

    /// Ids of all topology units.
    pub async fn units(&self) -> Vec<UnitId> {
        self.topology.lock().await.all_units()
    }

    /// Stops every actor and background task.
    pub async fn shutdown(self) {
        let _ = self.coordinator.shutdown().await;
        for unit in self.topology.lock().await.all_units() {
            let _ = self.transport.publish(&unit, Envelope::Shutdown).await;
        }
        let _ = self.tracker.shutdown().await;
        self.detector_task.abort();
        self.manager_task.abort();
    }
}
