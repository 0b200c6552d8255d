//! Scenario tests for the operator execution state machine.

use super::operator::OperatorUnit;
use super::UnitError;
use crate::coordinator::CoordinatorHandle;
use crate::functions::{CountReducer, IdentityMapper};
use crate::message::{Message, MessageKind, STATE_NOT_FOUND, TrackingInfo, UnitId};
use crate::persist::{FileStateLog, RecordKind, StateLog};
use crate::topology::{OperatorSettings, UnitRole};
use crate::tracker::{TrackerHandle, spawn_tracker};
use crate::transport::{Envelope, LocalTransport, QueryKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    transport: Arc<LocalTransport>,
    tracker: TrackerHandle,
    replace_tx: mpsc::Sender<UnitId>,
}

fn harness() -> Harness {
    let (coordinator, mut coordinator_rx) = CoordinatorHandle::channel();
    // Drain coordinator commands; these tests drive units directly.
    tokio::spawn(async move { while coordinator_rx.recv().await.is_some() {} });
    let (replace_tx, mut replace_rx) = mpsc::channel(16);
    tokio::spawn(async move { while replace_rx.recv().await.is_some() {} });
    Harness {
        transport: Arc::new(LocalTransport::new()),
        tracker: spawn_tracker(coordinator),
        replace_tx,
    }
}

fn stateful(
    harness: &Harness,
    id: &str,
    upstream_count: u32,
    log: Option<Box<dyn StateLog>>,
    is_replacement: bool,
) -> OperatorUnit {
    OperatorUnit::new(
        UnitId::from(id),
        OperatorSettings::new(UnitRole::Stateful),
        upstream_count,
        harness.transport.clone(),
        harness.tracker.clone(),
        harness.replace_tx.clone(),
        5,
        Box::new(IdentityMapper),
        Box::new(CountReducer),
        log,
        is_replacement,
    )
}

fn normal(key: &str, batch: i64, origin: &str, edge_count: u64) -> Message {
    let mut msg = Message::normal(key, 1, batch, UnitId::from(origin));
    msg.edge_count = edge_count;
    msg
}

fn control(kind: MessageKind, batch: i64, origin: &str, expected: u32, edge_count: u64) -> Message {
    let mut msg = Message::control(
        kind,
        batch,
        UnitId::from(origin),
        TrackingInfo::new(UnitId::from(origin), expected),
    );
    msg.edge_count = edge_count;
    msg
}

async fn eventually<F>(mut probe: F) -> bool
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..100 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn three_messages_then_barrier_then_full_reset() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 1, None, false);

    for i in 1..=3 {
        unit.execute(normal("me", 0, "up-0", i)).await.unwrap();
    }
    assert_eq!(unit.query(QueryKind::State("me".to_string())), 3);

    // Register the upstream's wave so the unit's acknowledgement lands.
    let barrier = control(MessageKind::Barrier, 0, "up-0", 1, 3);
    harness.tracker.track_barrier(barrier.clone()).await.unwrap();
    unit.execute(barrier).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("me".to_string())), 3);

    let tracker = harness.tracker.clone();
    assert!(
        eventually(async || tracker.is_ready_for_commit(0).await.unwrap()).await,
        "barrier wave should complete after the sink acknowledges"
    );

    // Recovery with no committed batch clears everything.
    let recovery = control(MessageKind::Recovery, -1, "up-0", 1, 0);
    harness.tracker.track_recovery(recovery.clone()).await.unwrap();
    unit.execute(recovery).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("me".to_string())), STATE_NOT_FOUND);
    assert_eq!(unit.query(QueryKind::CurrentBatch), 0);
}

#[tokio::test]
async fn increments_are_exactly_once() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 1, None, false);

    unit.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("me".to_string())), 1);
    unit.execute(normal("me", 0, "up-0", 2)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("me".to_string())), 2);
}

#[tokio::test]
async fn incremental_log_mirrors_state_until_commit() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 1, None, false);

    unit.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    assert_eq!(
        unit.query(QueryKind::IncrementalLog { key: "me".to_string(), batch: None }),
        unit.query(QueryKind::State("me".to_string()))
    );
}

#[tokio::test]
async fn commit_discards_sub_maps_and_advances() {
    let tmp = tempfile::TempDir::new().unwrap();
    let log_path = tmp.path().join("stateful-0.log");
    let harness = harness();
    let mut unit = stateful(
        &harness,
        "stateful-0",
        1,
        Some(Box::new(FileStateLog::new(&log_path).unwrap())),
        false,
    );

    unit.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    unit.execute(normal("me", 0, "up-0", 2)).await.unwrap();

    let commit = control(MessageKind::Commit, 0, "up-0", 1, 0);
    harness.tracker.track_commit(commit.clone()).await.unwrap();
    unit.execute(commit).await.unwrap();

    assert_eq!(unit.query(QueryKind::CurrentBatch), 1);
    // Reverse log emptiness after insert-then-commit.
    assert_eq!(
        unit.query(QueryKind::ReverseLog { key: "me".to_string(), batch: Some(0) }),
        STATE_NOT_FOUND
    );
    assert_eq!(
        unit.query(QueryKind::IncrementalLog { key: "me".to_string(), batch: Some(0) }),
        STATE_NOT_FOUND
    );

    // One more message lands in batch 1; its incremental entry mirrors state.
    unit.execute(normal("me", 1, "up-0", 1)).await.unwrap();
    assert_eq!(
        unit.query(QueryKind::IncrementalLog { key: "me".to_string(), batch: Some(1) }),
        3
    );

    // Batch 0 is a checkpoint boundary: the record is a full snapshot.
    let records = FileStateLog::new(&log_path).unwrap().read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Checkpoint);
    assert_eq!(records[0].entries.get("me"), Some(&2));
}

#[tokio::test]
async fn barrier_alignment_releases_buffered_batch_once_in_order() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 2, None, false);

    // Batch 1 messages arrive before batch 0 is sealed: buffered.
    unit.execute(normal("first", 1, "up-0", 1)).await.unwrap();
    unit.execute(normal("first", 1, "up-1", 1)).await.unwrap();
    unit.execute(normal("second", 1, "up-0", 2)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("first".to_string())), STATE_NOT_FOUND);

    // One barrier is not alignment.
    unit.execute(control(MessageKind::Barrier, 0, "up-0", 1, 0)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("first".to_string())), STATE_NOT_FOUND);

    // The second barrier aligns and flushes the buffer in original order.
    unit.execute(control(MessageKind::Barrier, 0, "up-1", 1, 0)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("first".to_string())), 2);
    assert_eq!(unit.query(QueryKind::State("second".to_string())), 1);

    // Once released, later batch-1 messages process directly.
    unit.execute(normal("second", 1, "up-1", 2)).await.unwrap();
    assert_eq!(unit.query(QueryKind::State("second".to_string())), 2);
}

#[tokio::test]
async fn batch_regression_is_rejected() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 1, None, false);

    unit.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    let commit = control(MessageKind::Commit, 0, "up-0", 1, 0);
    harness.tracker.track_commit(commit.clone()).await.unwrap();
    unit.execute(commit).await.unwrap();

    let err = unit.execute(normal("late", 0, "up-0", 1)).await.unwrap_err();
    assert!(matches!(err, UnitError::BatchRegression { batch_id: 0, current: 1 }));
}

#[tokio::test]
async fn barrier_claim_mismatch_is_rejected() {
    let harness = harness();
    let mut unit = stateful(&harness, "stateful-0", 1, None, false);

    unit.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    // The upstream claims two deliveries; only one was observed.
    let err = unit
        .execute(control(MessageKind::Barrier, 0, "up-0", 1, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, UnitError::DeliveryCountMismatch { claimed: 2, received: 1, .. }));
}

#[tokio::test]
async fn survivor_and_failed_paths_agree_on_recovery_target() {
    let tmp = tempfile::TempDir::new().unwrap();
    let log_path = tmp.path().join("stateful-0.log");
    let harness = harness();

    // Survivor: commit batch 0 at value 2, add an uncommitted batch-1 update,
    // then roll back to batch 0.
    let mut survivor = stateful(
        &harness,
        "stateful-0",
        1,
        Some(Box::new(FileStateLog::new(&log_path).unwrap())),
        false,
    );
    survivor.execute(normal("me", 0, "up-0", 1)).await.unwrap();
    survivor.execute(normal("me", 0, "up-0", 2)).await.unwrap();
    let commit = control(MessageKind::Commit, 0, "up-0", 1, 0);
    harness.tracker.track_commit(commit.clone()).await.unwrap();
    survivor.execute(commit).await.unwrap();
    survivor.execute(normal("me", 1, "up-0", 1)).await.unwrap();
    assert_eq!(survivor.query(QueryKind::State("me".to_string())), 3);

    survivor
        .execute(control(MessageKind::Recovery, 0, "up-0", 1, 0))
        .await
        .unwrap();
    assert_eq!(survivor.query(QueryKind::State("me".to_string())), 2);
    assert_eq!(survivor.query(QueryKind::CurrentBatch), 1);

    // Failed-unit path: a replacement with empty memory rebuilds the same
    // state from the durable log.
    let mut replacement = stateful(
        &harness,
        "stateful-0-r1",
        1,
        Some(Box::new(FileStateLog::new(&log_path).unwrap())),
        true,
    );
    replacement
        .execute(control(MessageKind::Recovery, 0, "up-0", 1, 0))
        .await
        .unwrap();
    assert_eq!(replacement.query(QueryKind::State("me".to_string())), 2);
    assert_eq!(replacement.query(QueryKind::CurrentBatch), 1);
}

#[tokio::test]
async fn stateless_unit_partitions_and_claims_per_edge() {
    let harness = harness();
    let mut left_rx = harness.transport.register(UnitId::from("stateful-0")).await;
    let mut right_rx = harness.transport.register(UnitId::from("stateful-1")).await;

    let mut settings = OperatorSettings::new(UnitRole::Stateless);
    settings
        .add_child(UnitId::from("stateful-0"), UnitRole::Stateful)
        .unwrap();
    settings
        .add_child(UnitId::from("stateful-1"), UnitRole::Stateful)
        .unwrap();
    let mut unit = OperatorUnit::new(
        UnitId::from("stateless-0"),
        settings,
        1,
        harness.transport.clone(),
        harness.tracker.clone(),
        harness.replace_tx.clone(),
        5,
        Box::new(IdentityMapper),
        Box::new(CountReducer),
        None,
        false,
    );

    let keys = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for (i, key) in keys.iter().enumerate() {
        unit.execute(normal(key, 0, "source-0", (i + 1) as u64)).await.unwrap();
    }
    unit.execute(control(MessageKind::Barrier, 0, "source-0", 1, keys.len() as u64))
        .await
        .unwrap();

    async fn drain(rx: &mut mpsc::Receiver<Envelope>) -> (Vec<Message>, Option<Message>) {
        let mut normals: Vec<Message> = Vec::new();
        let mut barrier = None;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            match envelope {
                Envelope::Data(msg) if msg.kind == MessageKind::Normal => normals.push(msg),
                Envelope::Data(msg) if msg.kind == MessageKind::Barrier => {
                    barrier = Some(msg);
                    break;
                }
                _ => {}
            }
        }
        (normals, barrier)
    }

    let (left, left_barrier) = drain(&mut left_rx).await;
    let (right, right_barrier) = drain(&mut right_rx).await;
    assert_eq!(left.len() + right.len(), keys.len());

    // Per-edge counters are sequential, and the barrier claims each total.
    for msgs in [&left, &right] {
        for (i, msg) in msgs.iter().enumerate() {
            assert_eq!(msg.edge_count, (i + 1) as u64);
        }
    }
    assert_eq!(left_barrier.unwrap().edge_count, left.len() as u64);
    assert_eq!(right_barrier.unwrap().edge_count, right.len() as u64);

    // Each key always routes to the same child.
    for msg in &left {
        assert!(!right.iter().any(|m| m.key == msg.key));
    }
}
