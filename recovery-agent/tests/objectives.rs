mod common;

use common::{Fixture, MockNode};
use recovery_agent::objectives::{ObjectiveKind, ObjectiveResult};
use recovery_agent::store::BackupKind;
use recovery_agent::{Command, DrError};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn rto_measures_time_until_healthy() {
    let fx = Fixture::with_node(MockNode::new(1000, Duration::from_secs(120)));
    let dispatcher = fx.dispatcher();
    dispatcher.backup_engine().create(BackupKind::Full).await.unwrap();

    let result = dispatcher.objective_tester().test_rto().await.unwrap();
    assert_eq!(
        result,
        ObjectiveResult {
            kind: ObjectiveKind::Rto,
            measured: 120,
            target: 900,
            passed: true,
            blocks_lost: None,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rto_over_target_is_a_failed_result_not_an_error() {
    let mut fx = Fixture::with_node(MockNode::new(1000, Duration::from_secs(120)));
    fx.config.objectives.rto_target_secs = 60;
    let dispatcher = fx.dispatcher();
    dispatcher.backup_engine().create(BackupKind::Full).await.unwrap();

    let outcome = dispatcher.run(Command::TestRto).await;
    assert!(!outcome.success);
    assert!(outcome.summary.starts_with("RTO FAIL"), "{}", outcome.summary);
}

#[tokio::test]
async fn rpo_converts_lost_blocks_to_time() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher();
    dispatcher.backup_engine().create(BackupKind::Full).await.unwrap();

    // The restored chain is 50 blocks behind the live one
    fx.node.set_height_on_start(950);
    let result = dispatcher.objective_tester().test_rpo().await.unwrap();

    assert_eq!(result.kind, ObjectiveKind::Rpo);
    assert_eq!(result.blocks_lost, Some(50));
    assert_eq!(result.measured, 600);
    assert_eq!(result.target, 3600);
    assert!(result.passed);
}

#[tokio::test(start_paused = true)]
async fn await_healthy_is_bounded_by_attempts_times_interval() {
    let mut fx = Fixture::with_node(MockNode::new(1000, Duration::from_secs(3600)));
    fx.config.health.max_attempts = 5;
    fx.config.health.interval_secs = 10;
    let dispatcher = fx.dispatcher();

    let started = tokio::time::Instant::now();
    let err = dispatcher.backup_engine().create(BackupKind::Full).await.unwrap_err();

    assert!(matches!(err, DrError::HealthTimeout { attempts: 5 }), "{}", err);
    assert!(started.elapsed() <= Duration::from_secs(5 * 10));
}

#[tokio::test]
async fn failed_rto_restore_brings_the_node_back() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher();

    let err = dispatcher.objective_tester().test_rto().await.unwrap_err();
    assert!(matches!(err, DrError::NotFound(_)), "{}", err);
    assert!(fx.node.running());
    assert_eq!((fx.node.stops(), fx.node.starts()), (1, 1));

    // A failed test leaves the node usable for the next command
    assert!(dispatcher.run(Command::Health).await.success);
}

#[tokio::test]
async fn rto_restore_of_tampered_backup_restarts_the_node() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher();
    let record = dispatcher.backup_engine().create(BackupKind::Full).await.unwrap();
    std::fs::write(&record.artifact_path, b"garbage").unwrap();

    let err = dispatcher.objective_tester().test_rto().await.unwrap_err();
    assert!(matches!(err, DrError::Integrity { .. }), "{}", err);
    assert!(fx.node.running());
}
