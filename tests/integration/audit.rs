//! Audit trail and event stream behavior.

use std::time::Duration;

use taskline::testing::FailingConsumer;
use taskline::{
    AuditStore, GroupId, Page, RetryContext, ScheduleRequest, ScheduleType, TaskId, TaskKey,
    TaskOutcome,
};

use crate::common::{fast_config, rig, rig_with, wait_for_audit_count};

#[tokio::test]
async fn test_deleting_a_group_keeps_its_history() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    for task in ["a", "b"] {
        rig.dispatcher
            .schedule(
                ScheduleRequest::new(
                    TaskKey::new("reports", task),
                    "recording",
                    ScheduleType::Immediate,
                )
                .with_parameter("value", task),
            )
            .await
            .unwrap();
    }

    wait_for_audit_count(&rig.audit, 2, Duration::from_secs(3)).await;

    // Bindings are consumed by firing, but add one pending binding so the
    // group delete has something live to remove.
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("reports", "pending"),
                "recording",
                ScheduleType::at(chrono::Utc::now() + chrono::Duration::hours(1)),
            )
            .with_parameter("value", "never"),
        )
        .await
        .unwrap();

    rig.dispatcher
        .delete_group(&GroupId::new("reports"))
        .await
        .unwrap();
    rig.engine.stop(false).await.unwrap();

    assert!(!rig.dispatcher.group_exists(&GroupId::new("reports")).await.unwrap());
    assert_eq!(rig.audit.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_every_attempt_lands_in_the_trail_exactly_once() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    for i in 0..5 {
        rig.dispatcher
            .schedule(
                ScheduleRequest::new(
                    TaskKey::new("burst", format!("t{}", i)),
                    "recording",
                    ScheduleType::Immediate,
                )
                .with_parameter("value", format!("v{}", i)),
            )
            .await
            .unwrap();
    }

    wait_for_audit_count(&rig.audit, 5, Duration::from_secs(3)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.engine.stop(false).await.unwrap();

    assert_eq!(rig.audit.count().await.unwrap(), 5);
    assert_eq!(rig.recorder.count(), 5);
}

#[tokio::test]
async fn test_per_task_query_and_most_recent() {
    let rig = rig();
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "target"), "recording", ScheduleType::Immediate)
                .with_parameter("value", "one"),
        )
        .await
        .unwrap();
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "other"), "recording", ScheduleType::Immediate)
                .with_parameter("value", "two"),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 2, Duration::from_secs(3)).await;
    rig.engine.stop(false).await.unwrap();

    let target = rig
        .audit
        .find(&GroupId::new("g"), &TaskId::new("target"), Page::default())
        .await
        .unwrap();
    assert_eq!(target.len(), 1);

    let latest = rig
        .audit
        .most_recent(&GroupId::new("g"), &TaskId::new("target"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.outcome, TaskOutcome::Success);
}

#[tokio::test]
async fn test_event_stream_announces_consumed_tasks() {
    let rig = rig();
    let bus = rig.engine.event_bus();
    let (_, mut live) = bus.subscribe();

    rig.engine.start().await.unwrap();
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "announced"), "recording", ScheduleType::Immediate)
                .with_parameter("value", "v"),
        )
        .await
        .unwrap();

    let line = tokio::time::timeout(Duration::from_secs(3), live.recv())
        .await
        .expect("timed out waiting for event")
        .unwrap();
    assert!(line.contains("Consumed task type 'recording'"));
    assert!(line.contains("Group Id: g"));
    assert!(line.contains("Task Id: announced"));

    // A late subscriber sees the same line from the replay buffer.
    let (backlog, _) = bus.subscribe();
    assert_eq!(backlog.len(), 1);

    bus.clear();
    let (backlog, _) = bus.subscribe();
    assert!(backlog.is_empty());

    rig.engine.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_event_stream_announces_failed_tasks() {
    let failing = FailingConsumer::always();
    let rig = rig_with(fast_config(), move |registry| {
        registry.register("failing", failing);
    });
    let bus = rig.engine.event_bus();
    let (_, mut live) = bus.subscribe();

    rig.engine.start().await.unwrap();
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "doomed"), "failing", ScheduleType::Immediate)
                .with_retry(RetryContext::none()),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;

    let line = tokio::time::timeout(Duration::from_millis(500), live.recv())
        .await
        .expect("no event line was published for the failed attempt")
        .unwrap();
    assert!(line.contains("Failed to consume task type 'failing'"));
    assert!(line.contains("Group Id: g"));
    assert!(line.contains("Task Id: doomed"));
    assert!(line.contains("Error:"));

    rig.engine.stop(false).await.unwrap();
}
