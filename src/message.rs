//! Message envelope and tracking value objects.
//!
//! Every payload that moves between units is a [`Message`]. Ordinary records
//! carry the batch id assigned by their source; control messages (barrier,
//! commit, recovery) additionally carry a [`TrackingInfo`] that the batch
//! tracker uses to decide when a wave has propagated through every fan-out
//! path. Ordering is per-producer only; no global total order is assumed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel returned by state queries when a stateful unit does not hold the
/// requested key (or the requested per-batch sub-map no longer exists).
pub const STATE_NOT_FOUND: i64 = -1;

/// Sentinel returned by state queries when the probed unit holds no state at
/// all (Source and Stateless units). Lets external probes distinguish "not
/// found locally" from "not found anywhere".
pub const STATE_NOT_HERE: i64 = -2;

/// Identifier of a processing unit.
///
/// Units are addressed by identifier everywhere in the engine; the topology
/// graph, the tracker, and the transport never hold live unit references.
/// Well-known ids (source, coordinator) are resolved once at bootstrap.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct UnitId(pub String);

impl UnitId {
    /// Creates a new unit id from a string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a message flowing along a topology edge.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageKind {
    /// Ordinary record, partitioned to exactly one downstream unit.
    Normal,
    /// Batch boundary marker, broadcast to all downstream units.
    Barrier,
    /// Commit instruction for a fully propagated batch, broadcast.
    Commit,
    /// Rollback instruction carrying the recovery target batch, broadcast.
    Recovery,
}

impl MessageKind {
    /// True for barrier, commit and recovery messages.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageKind::Normal)
    }
}

/// Acknowledgement bookkeeping for one broadcast hop of a control wave.
///
/// The unit that broadcasts a control message registers one `TrackingInfo`
/// sized to its immediate fan-out; every recipient reports completion back to
/// the tracker. `completed` exceeding `expected` is a defect, rejected by the
/// tracker rather than silently accepted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackingInfo {
    /// Identifier of the unit that broadcast this hop of the wave.
    pub id: UnitId,
    /// Number of downstream acknowledgements this hop expects.
    pub expected: u32,
    /// Number of acknowledgements that have arrived.
    pub completed: u32,
}

impl TrackingInfo {
    /// Creates tracking info for a broadcast to `expected` downstream units.
    pub fn new(id: UnitId, expected: u32) -> Self {
        Self {
            id,
            expected,
            completed: 0,
        }
    }

    /// True once every expected acknowledgement has arrived.
    pub fn is_complete(&self) -> bool {
        self.completed == self.expected
    }
}

/// A record or control marker flowing between units.
#[derive(Clone, Debug)]
pub struct Message {
    /// Record key; partitioning and state are keyed by it. Empty for control
    /// messages.
    pub key: String,
    /// Record value (aggregation weight for the word-count deployment).
    pub value: i64,
    /// Batch this message belongs to; assigned by the source at production
    /// time for normal messages, stamped by the coordinator for control
    /// messages. The recovery message carries the rollback target here.
    pub batch_id: i64,
    /// Unit that sent this message on this edge.
    pub origin: UnitId,
    /// Per-edge delivery counter. For normal messages: the 1-based sequence
    /// number of this message on this edge within its batch. For barriers:
    /// the claimed total of normal messages sent on this edge in the batch,
    /// validated by the receiving unit.
    pub edge_count: u64,
    /// Wave acknowledgement bookkeeping; always `Some` for control messages.
    pub tracking: Option<TrackingInfo>,
    /// Message kind.
    pub kind: MessageKind,
}

impl Message {
    /// Creates a normal record message.
    pub fn normal(key: impl Into<String>, value: i64, batch_id: i64, origin: UnitId) -> Self {
        Self {
            key: key.into(),
            value,
            batch_id,
            origin,
            edge_count: 0,
            tracking: None,
            kind: MessageKind::Normal,
        }
    }

    /// Creates a control message of the given kind carrying tracking info.
    pub fn control(kind: MessageKind, batch_id: i64, origin: UnitId, tracking: TrackingInfo) -> Self {
        Self {
            key: String::new(),
            value: 0,
            batch_id,
            origin,
            edge_count: 0,
            tracking: Some(tracking),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_info_completeness() {
        let mut info = TrackingInfo::new(UnitId::from("source-0"), 2);
        assert!(!info.is_complete());
        info.completed = 2;
        assert!(info.is_complete());
    }

    #[test]
    fn control_kinds() {
        assert!(MessageKind::Barrier.is_control());
        assert!(MessageKind::Commit.is_control());
        assert!(MessageKind::Recovery.is_control());
        assert!(!MessageKind::Normal.is_control());
    }

    #[test]
    fn control_message_carries_tracking() {
        let msg = Message::control(
            MessageKind::Barrier,
            3,
            UnitId::from("source-0"),
            TrackingInfo::new(UnitId::from("source-0"), 4),
        );
        assert_eq!(msg.batch_id, 3);
        assert!(msg.tracking.is_some());
    }
}
