//! End-to-end scheduling scenarios.

use std::time::Duration;

use taskline::{
    AuditStore, DispatchError, GroupId, Page, ScheduleRequest, ScheduleType, TaskKey,
    TaskOutcome, TriggerStore,
};

use crate::common::{rig, wait_for_audit_count, wait_for_store_count};

#[tokio::test]
async fn test_immediate_task_fires_once_and_completes() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("notify", "welcome"), "recording", ScheduleType::Immediate)
                .with_parameter("value", "X"),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    wait_for_store_count(&rig.store, 0, Duration::from_secs(3)).await;

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, TaskOutcome::Success);
    assert_eq!(records[0].log, None);
    assert_eq!(records[0].node_id, "node-test");
    assert!(!records[0].misfire);

    assert_eq!(rig.recorder.seen(), vec!["X".to_string()]);

    rig.engine.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_fresh_key_yields_one_snapshot_and_visible_group() {
    let rig = rig();

    let key = rig
        .dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("billing", "invoice"),
                "recording",
                ScheduleType::at(chrono::Utc::now() + chrono::Duration::hours(1)),
            )
            .with_parameter("value", "later"),
        )
        .await
        .unwrap();

    let snapshots = rig.dispatcher.all(Some(&GroupId::new("billing"))).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].key, key);
    assert!(rig.dispatcher.group_exists(&GroupId::new("billing")).await.unwrap());
    assert_eq!(rig.dispatcher.groups().await.unwrap(), vec![GroupId::new("billing")]);
}

#[tokio::test]
async fn test_duplicate_key_rejected_original_untouched() {
    let rig = rig();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "t"), "recording", ScheduleType::Immediate)
                .with_parameter("value", "original"),
        )
        .await
        .unwrap();

    let duplicate = rig
        .dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("g", "t"),
                "recording",
                ScheduleType::interval(0, 1, 0, 0).unwrap(),
            )
            .with_parameter("value", "imposter"),
        )
        .await;

    assert!(matches!(duplicate, Err(DispatchError::DuplicateTask(_))));

    let snapshot = rig.dispatcher.get(&TaskKey::new("g", "t")).await.unwrap();
    assert_eq!(snapshot.schedule, "@immediate");
    assert!(!snapshot.recurring);
}

#[tokio::test]
async fn test_interval_task_fires_on_cadence() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("metrics", "rollup"),
                "recording",
                ScheduleType::interval(0, 0, 0, 1).unwrap(),
            )
            .with_parameter("value", "tick"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    rig.engine.stop(false).await.unwrap();

    // One-second cadence with the first fire one interval out: three
    // fires expected in the window, four if timing runs tight.
    let fires = rig.recorder.count();
    assert!(
        (3..=4).contains(&fires),
        "expected 3-4 fires in 3.5s, got {}",
        fires
    );

    // The binding survives: recurring tasks are never consumed by firing.
    assert_eq!(rig.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_consumer_records_error() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("g", "t"),
                "nonexistent",
                ScheduleType::Immediate,
            )
            .with_retry(taskline::RetryContext::none()),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert_eq!(records[0].outcome, TaskOutcome::Error);
    assert!(
        records[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("unknown consumer type")
    );
}

#[tokio::test]
async fn test_missing_parameter_fails_attempt() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    // RecordingConsumer requires a "value" parameter; omit it.
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "t"), "recording", ScheduleType::Immediate)
                .with_retry(taskline::RetryContext::none()),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert_eq!(records[0].outcome, TaskOutcome::Error);
    assert!(records[0].detail.as_deref().unwrap().contains("missing property"));
    assert_eq!(rig.recorder.count(), 0);
}
