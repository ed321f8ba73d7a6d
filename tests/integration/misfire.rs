//! Misfire detection and coalescing.

use std::time::Duration;

use serde_json::Map;
use taskline::{
    AuditStore, Page, RetryContext, ScheduleType, TaskBinding, TaskKey, TaskOutcome,
    TriggerStore,
};

use crate::common::{fast_config, rig_with, wait_for_audit_count};

#[tokio::test]
async fn test_lagging_trigger_coalesces_into_one_misfire_attempt() {
    let rig = rig_with(
        fast_config().with_misfire_threshold(Duration::from_secs(1)),
        |_| {},
    );

    // Plant a recurring binding whose fire instant is long past, as if
    // the process had been down: ten missed one-second occurrences.
    let mut parameters = Map::new();
    parameters.insert("value".into(), "late".into());
    let binding = TaskBinding::new(
        TaskKey::new("g", "lagging"),
        "recording",
        ScheduleType::interval(0, 0, 0, 1).unwrap(),
        parameters,
        chrono::Utc::now() - chrono::Duration::seconds(10),
        RetryContext::default(),
    );
    rig.store.put(binding).await.unwrap();

    rig.engine.start().await.unwrap();

    // First attempt serves the backlog, second lands on the new cadence.
    wait_for_audit_count(&rig.audit, 2, Duration::from_secs(4)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    let misfires: Vec<_> = records.iter().filter(|r| r.misfire).collect();
    assert_eq!(misfires.len(), 1, "backlog must coalesce into one misfire");
    assert_eq!(misfires[0].outcome, TaskOutcome::Success);

    // The oldest record is the misfired one; the cadence resumed after it.
    assert!(records.last().unwrap().misfire);
    assert!(!records.first().unwrap().misfire);
}

#[tokio::test]
async fn test_small_lag_is_not_a_misfire() {
    let rig = rig_with(
        fast_config().with_misfire_threshold(Duration::from_secs(60)),
        |_| {},
    );

    let mut parameters = Map::new();
    parameters.insert("value".into(), "on-time".into());
    let binding = TaskBinding::new(
        TaskKey::new("g", "prompt"),
        "recording",
        ScheduleType::Immediate,
        parameters,
        chrono::Utc::now(),
        RetryContext::default(),
    );
    rig.store.put(binding).await.unwrap();

    rig.engine.start().await.unwrap();
    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert!(!records[0].misfire);
}

#[tokio::test]
async fn test_misfired_one_shot_still_runs_once() {
    let rig = rig_with(
        fast_config().with_misfire_threshold(Duration::from_millis(100)),
        |_| {},
    );

    let mut parameters = Map::new();
    parameters.insert("value".into(), "overdue".into());
    let binding = TaskBinding::new(
        TaskKey::new("g", "overdue"),
        "recording",
        ScheduleType::at(chrono::Utc::now() - chrono::Duration::hours(1)),
        parameters,
        chrono::Utc::now() - chrono::Duration::hours(1),
        RetryContext::default(),
    );
    rig.store.put(binding).await.unwrap();

    rig.engine.start().await.unwrap();
    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].misfire);
    assert_eq!(records[0].outcome, TaskOutcome::Success);
    assert_eq!(rig.recorder.seen(), vec!["overdue".to_string()]);
    assert_eq!(rig.store.count().await.unwrap(), 0);
}
