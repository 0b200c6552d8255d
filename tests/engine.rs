//! End-to-end engine tests: ingest, barrier, commit, query, recovery and
//! replacement over the full source → stateless → stateful topology.

use sluice::config::EngineConfig;
use sluice::engine::Engine;
use sluice::message::{STATE_NOT_FOUND, STATE_NOT_HERE, UnitId};
use std::time::Duration;

fn quiet_config() -> EngineConfig {
    // Long periodic timers: the tests drive barriers and recovery manually.
    EngineConfig::default()
        .with_barrier_interval(Duration::from_secs(300))
        .with_probe_interval(Duration::from_secs(300))
        .with_probe_timeout(Duration::from_millis(200))
}

async fn eventually<F>(mut probe: F) -> bool
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..300 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn word_count_flows_through_barrier_and_commit() {
    let engine = Engine::start(quiet_config().with_stateless_units(1).with_stateful_units(2))
        .await
        .unwrap();
    assert_eq!(engine.topology_size().await, 4);

    for _ in 0..3 {
        engine.ingest("me", 1).await.unwrap();
    }
    engine.ingest("you", 1).await.unwrap();

    assert!(!engine.is_ready_for_commit(0).await.unwrap());
    engine.emit_barrier().await.unwrap();

    assert!(engine.await_commit(0, Duration::from_secs(5)).await.unwrap());
    assert!(engine.is_ready_for_commit(0).await.unwrap());
    assert!(engine.is_commit_success(0).await.unwrap());
    assert!(!engine.is_ready_for_commit(1).await.unwrap());
    assert_eq!(engine.committed_batch_id().await.unwrap(), 0);

    assert_eq!(engine.lookup_state("me").await.unwrap(), 3);
    assert_eq!(engine.lookup_state("you").await.unwrap(), 1);
    assert_eq!(engine.lookup_state("nobody").await.unwrap(), STATE_NOT_FOUND);

    // Units without keyed state answer with the not-here sentinel.
    assert_eq!(
        engine
            .get_state(&UnitId::from("stateless-0"), "me")
            .await
            .unwrap(),
        STATE_NOT_HERE
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn incremental_log_mirrors_state_and_commit_discards_it() {
    let engine = Engine::start(quiet_config().with_stateless_units(1).with_stateful_units(1))
        .await
        .unwrap();
    let owner = UnitId::from("stateful-0");

    engine.ingest("k", 1).await.unwrap();
    engine.ingest("k", 1).await.unwrap();
    assert!(
        eventually(async || engine.lookup_state("k").await.unwrap() == 2).await,
        "state should reach 2 before the barrier"
    );

    // Before any commit the incremental log mirrors state.
    assert_eq!(
        engine
            .get_state_in_incremental_log(&owner, "k", Some(0))
            .await
            .unwrap(),
        2
    );

    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(0, Duration::from_secs(5)).await.unwrap());

    // Both per-batch sub-maps for batch 0 are gone; state survives.
    assert_eq!(
        engine
            .get_state_in_reverse_log(&owner, "k", Some(0))
            .await
            .unwrap(),
        STATE_NOT_FOUND
    );
    assert_eq!(
        engine
            .get_state_in_incremental_log(&owner, "k", Some(0))
            .await
            .unwrap(),
        STATE_NOT_FOUND
    );
    assert_eq!(engine.lookup_state("k").await.unwrap(), 2);

    // The next message lands in batch 1 with a fresh mirror.
    engine.ingest("k", 1).await.unwrap();
    assert!(
        eventually(async || {
            engine
                .get_state_in_incremental_log(&owner, "k", Some(1))
                .await
                .unwrap()
                == 3
        })
        .await,
        "batch 1 incremental entry should mirror the new state"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn recovery_rolls_back_then_replays_uncommitted_work() {
    let engine = Engine::start(quiet_config().with_stateless_units(1).with_stateful_units(1))
        .await
        .unwrap();
    let owner = UnitId::from("stateful-0");

    engine.ingest("me", 1).await.unwrap();
    engine.ingest("me", 1).await.unwrap();
    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(0, Duration::from_secs(5)).await.unwrap());

    // Uncommitted batch-1 work on top of the committed value 2.
    engine.ingest("me", 1).await.unwrap();
    assert!(eventually(async || engine.lookup_state("me").await.unwrap() == 3).await);

    engine.start_recovery().await.unwrap();

    // The survivor rolls back to the committed batch, then the source
    // replays the retained batch-1 message, restoring the total.
    assert!(
        eventually(async || {
            engine.lookup_state("me").await.unwrap() == 3
                && engine.current_batch(&owner).await.unwrap() == 1
        })
        .await,
        "replayed work should land in batch 1 after rollback"
    );

    // The re-processed batch commits under its original number.
    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(1, Duration::from_secs(5)).await.unwrap());
    assert_eq!(engine.committed_batch_id().await.unwrap(), 1);
    assert_eq!(engine.lookup_state("me").await.unwrap(), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn replacement_recovers_from_the_durable_log() {
    let tmp = tempfile::TempDir::new().unwrap();
    let engine = Engine::start(
        quiet_config()
            .with_stateless_units(1)
            .with_stateful_units(1)
            .with_log_dir(tmp.path()),
    )
    .await
    .unwrap();

    engine.ingest("me", 1).await.unwrap();
    engine.ingest("me", 1).await.unwrap();
    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(0, Duration::from_secs(5)).await.unwrap());

    // Replace the stateful unit as the detector would after a failed probe.
    engine.replace_unit(UnitId::from("stateful-0")).await.unwrap();
    let replacement = UnitId::from("stateful-0-r1");
    assert!(
        eventually(async || engine.units().await.contains(&replacement)).await,
        "replacement should appear in the topology"
    );
    assert_eq!(engine.topology_size().await, 3);

    // The fresh instance holds nothing until recovery replays the log.
    assert_eq!(
        engine.get_state(&replacement, "me").await.unwrap(),
        STATE_NOT_FOUND
    );

    engine.start_recovery().await.unwrap();
    assert!(
        eventually(async || {
            engine.get_state(&replacement, "me").await.unwrap() == 2
                && engine.current_batch(&replacement).await.unwrap() == 1
        })
        .await,
        "failed-unit recovery should rebuild committed state from the log"
    );

    // Processing continues through the rewired topology.
    engine.ingest("me", 1).await.unwrap();
    assert!(eventually(async || engine.lookup_state("me").await.unwrap() == 3).await);
    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(1, Duration::from_secs(5)).await.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn recovery_with_nothing_committed_clears_and_replays_from_scratch() {
    let engine = Engine::start(quiet_config().with_stateless_units(1).with_stateful_units(1))
        .await
        .unwrap();
    let owner = UnitId::from("stateful-0");

    for _ in 0..3 {
        engine.ingest("me", 1).await.unwrap();
    }
    assert!(eventually(async || engine.lookup_state("me").await.unwrap() == 3).await);

    // No batch has committed: the rollback target is -1.
    engine.start_recovery().await.unwrap();
    assert!(
        eventually(async || {
            engine.current_batch(&owner).await.unwrap() == 0
                && engine.lookup_state("me").await.unwrap() == 3
        })
        .await,
        "state should be rebuilt from the replayed batch 0"
    );

    engine.emit_barrier().await.unwrap();
    assert!(engine.await_commit(0, Duration::from_secs(5)).await.unwrap());
    assert_eq!(engine.lookup_state("me").await.unwrap(), 3);

    engine.shutdown().await;
}
