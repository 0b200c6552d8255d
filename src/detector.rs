//! Liveness polling and replacement requests.
//!
//! On a fixed interval the detector snapshots the topology, issues a bounded
//! liveness probe to every unit's mailbox and, for any unit whose probe does
//! not complete in time, requests its replacement. Detection only: the
//! detector never mutates topology or unit state itself, and it never
//! initiates coordinator recovery; that remains an external supervisory
//! decision.

use crate::message::UnitId;
use crate::topology::TopologyGraph;
use crate::transport::{Envelope, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the error detector.
#[derive(Clone, Copy, Debug)]
pub struct ErrorDetectorConfig {
    /// Interval between poll rounds.
    pub probe_interval: Duration,
    /// A unit is failed if its probe does not complete within this timeout.
    pub probe_timeout: Duration,
}

impl Default for ErrorDetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Periodic liveness prober over all topology units.
pub struct ErrorDetector {
    topology: Arc<Mutex<TopologyGraph>>,
    transport: Arc<dyn Transport>,
    replace_tx: mpsc::Sender<UnitId>,
    config: ErrorDetectorConfig,
}

impl ErrorDetector {
    /// Creates a detector over the given topology and transport.
    pub fn new(
        topology: Arc<Mutex<TopologyGraph>>,
        transport: Arc<dyn Transport>,
        replace_tx: mpsc::Sender<UnitId>,
        config: ErrorDetectorConfig,
    ) -> Self {
        Self {
            topology,
            transport,
            replace_tx,
            config,
        }
    }

    async fn probe(&self, unit: &UnitId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .transport
            .publish(unit, Envelope::Ping { reply })
            .await
            .is_err()
        {
            return false;
        }
        matches!(
            tokio::time::timeout(self.config.probe_timeout, rx).await,
            Ok(Ok(()))
        )
    }

    /// Probes every unit once, requesting replacement of each unresponsive
    /// one. Returns the failed unit ids.
    pub async fn probe_all(&self) -> Vec<UnitId> {
        let units = self.topology.lock().await.all_units();
        let mut failed = Vec::new();
        for unit in units {
            if self.probe(&unit).await {
                debug!(unit = %unit, "liveness probe ok");
                continue;
            }
            warn!(unit = %unit, "liveness probe failed, requesting replacement");
            let _ = self.replace_tx.send(unit.clone()).await;
            failed.push(unit);
        }
        failed
    }

    /// Runs the poll loop on a spawned task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.probe_all().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{OperatorSettings, TopologyUnit, UnitRole};
    use crate::transport::LocalTransport;

    fn config() -> ErrorDetectorConfig {
        ErrorDetectorConfig {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(50),
        }
    }

    async fn responsive_unit(transport: &LocalTransport, id: &str) {
        let mut rx = transport.register(UnitId::from(id)).await;
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Envelope::Ping { reply } = envelope {
                    let _ = reply.send(());
                }
            }
        });
    }

    #[tokio::test]
    async fn dead_unit_is_reported_for_replacement() {
        let transport = Arc::new(LocalTransport::new());
        responsive_unit(&transport, "stateful-0").await;
        // Registered but its mailbox receiver is gone: probes fail.
        let dead_rx = transport.register(UnitId::from("stateful-1")).await;
        drop(dead_rx);

        let mut graph = TopologyGraph::new();
        for id in ["stateful-0", "stateful-1"] {
            graph
                .add_unit(TopologyUnit::new(
                    UnitId::from(id),
                    UnitRole::Stateful,
                    OperatorSettings::new(UnitRole::Stateful),
                ))
                .unwrap();
        }

        let (replace_tx, mut replace_rx) = mpsc::channel(8);
        let detector = ErrorDetector::new(
            Arc::new(Mutex::new(graph)),
            transport,
            replace_tx,
            config(),
        );

        let failed = detector.probe_all().await;
        assert_eq!(failed, vec![UnitId::from("stateful-1")]);
        assert_eq!(replace_rx.recv().await, Some(UnitId::from("stateful-1")));
    }

    #[tokio::test]
    async fn unresponsive_unit_times_out() {
        let transport = Arc::new(LocalTransport::new());
        // Mailbox exists but nothing answers pings.
        let _silent_rx = transport.register(UnitId::from("stateless-0")).await;

        let mut graph = TopologyGraph::new();
        graph
            .add_unit(TopologyUnit::new(
                UnitId::from("stateless-0"),
                UnitRole::Stateless,
                OperatorSettings::new(UnitRole::Stateless),
            ))
            .unwrap();

        let (replace_tx, mut replace_rx) = mpsc::channel(8);
        let detector = ErrorDetector::new(
            Arc::new(Mutex::new(graph)),
            transport,
            replace_tx,
            config(),
        );

        let failed = detector.probe_all().await;
        assert_eq!(failed, vec![UnitId::from("stateless-0")]);
        assert_eq!(replace_rx.recv().await, Some(UnitId::from("stateless-0")));
    }

    #[tokio::test]
    async fn healthy_units_are_left_alone() {
        let transport = Arc::new(LocalTransport::new());
        responsive_unit(&transport, "source-0").await;

        let mut graph = TopologyGraph::new();
        graph
            .add_unit(TopologyUnit::new(
                UnitId::from("source-0"),
                UnitRole::Source,
                OperatorSettings::new(UnitRole::Source),
            ))
            .unwrap();

        let (replace_tx, _replace_rx) = mpsc::channel(8);
        let detector = ErrorDetector::new(
            Arc::new(Mutex::new(graph)),
            transport,
            replace_tx,
            config(),
        );
        assert!(detector.probe_all().await.is_empty());
    }
}
