//! Message transport between units.
//!
//! The engine publishes envelopes to units by identifier and never manages
//! subscriber lifecycle; delivery is at-least-once and ordered per producer.
//! [`LocalTransport`] is the in-process implementation: a registry of unit
//! mailboxes, which doubles as the hosting runtime's remote-call surface.

use crate::message::{Message, UnitId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};

/// Error type for transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No mailbox registered under the target id.
    #[error("unknown unit: {0}")]
    UnknownUnit(UnitId),
    /// The target mailbox is closed (unit stopped or crashed).
    #[error("mailbox closed: {0}")]
    Closed(UnitId),
}

/// Query kinds answered by a unit's observable surface.
#[derive(Clone, Debug)]
pub enum QueryKind {
    /// Current value for a key in the unit's state.
    State(String),
    /// Pre-image recorded for a key in the reverse log. `batch` defaults to
    /// the unit's current batch.
    ReverseLog {
        /// Key to look up.
        key: String,
        /// Batch sub-map to consult; `None` means the current batch.
        batch: Option<i64>,
    },
    /// Post-image recorded for a key in the incremental log.
    IncrementalLog {
        /// Key to look up.
        key: String,
        /// Batch sub-map to consult; `None` means the current batch.
        batch: Option<i64>,
    },
    /// The batch the unit is currently processing.
    CurrentBatch,
}

/// Envelope delivered to a unit's mailbox.
#[derive(Debug)]
pub enum Envelope {
    /// A data or control message from another unit.
    Data(Message),
    /// Client record handed to the source for batch assignment and routing.
    Ingest {
        /// Record key.
        key: String,
        /// Record value.
        value: i64,
    },
    /// Observable query; missing data answers with a sentinel, never an error.
    Query {
        /// What to look up.
        kind: QueryKind,
        /// Reply channel.
        reply: oneshot::Sender<i64>,
    },
    /// Liveness probe from the error detector.
    Ping {
        /// Reply channel; answering at all is the liveness signal.
        reply: oneshot::Sender<()>,
    },
    /// Source only: re-drain the retained buffer after a completed recovery.
    Replay,
    /// Updated settings snapshot pushed after a topology mutation.
    Reconfigure(crate::topology::OperatorSettings),
    /// Stop the unit's actor loop.
    Shutdown,
}

/// Publish surface used by every unit and the coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers an envelope to the unit with the given id.
    async fn publish(&self, to: &UnitId, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process transport backed by per-unit mpsc mailboxes.
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<UnitId, mpsc::Sender<Envelope>>>,
}

impl LocalTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit's mailbox, returning the receiving end for its actor
    /// loop. Re-registering an id replaces the previous mailbox.
    pub async fn register(&self, id: UnitId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(256);
        self.routes.write().await.insert(id, tx);
        rx
    }

    /// Removes a unit's mailbox.
    pub async fn deregister(&self, id: &UnitId) {
        self.routes.write().await.remove(id);
    }

    /// True when a mailbox is registered under the id.
    pub async fn is_registered(&self, id: &UnitId) -> bool {
        self.routes.read().await.contains_key(id)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, to: &UnitId, envelope: Envelope) -> Result<(), TransportError> {
        let sender = {
            let routes = self.routes.read().await;
            routes
                .get(to)
                .cloned()
                .ok_or_else(|| TransportError::UnknownUnit(to.clone()))?
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed(to.clone()))
    }
}

/// Convenience for issuing a query against a unit and awaiting the reply.
pub async fn query_unit(
    transport: &dyn Transport,
    unit: &UnitId,
    kind: QueryKind,
) -> Result<i64, TransportError> {
    let (reply, rx) = oneshot::channel();
    transport.publish(unit, Envelope::Query { kind, reply }).await?;
    rx.await.map_err(|_| TransportError::Closed(unit.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[tokio::test]
    async fn publish_to_registered_mailbox() {
        let transport = LocalTransport::new();
        let id = UnitId::from("stateful-0");
        let mut rx = transport.register(id.clone()).await;

        let msg = Message::normal("k", 1, 0, UnitId::from("source-0"));
        transport.publish(&id, Envelope::Data(msg)).await.unwrap();

        match rx.recv().await {
            Some(Envelope::Data(m)) => {
                assert_eq!(m.kind, MessageKind::Normal);
                assert_eq!(m.key, "k");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_to_unknown_unit_fails() {
        let transport = LocalTransport::new();
        let err = transport
            .publish(&UnitId::from("ghost"), Envelope::Replay)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownUnit(_)));
    }

    #[tokio::test]
    async fn publish_to_dropped_mailbox_fails() {
        let transport = LocalTransport::new();
        let id = UnitId::from("stateful-0");
        let rx = transport.register(id.clone()).await;
        drop(rx);
        let err = transport.publish(&id, Envelope::Replay).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }
}
