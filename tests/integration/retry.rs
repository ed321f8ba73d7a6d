//! Retry backoff and exhaustion behavior.

use std::time::Duration;

use taskline::testing::FailingConsumer;
use taskline::{
    AuditStore, Page, RetryContext, ScheduleRequest, ScheduleType, TaskKey, TaskOutcome,
    TriggerStore,
};

use crate::common::{fast_config, rig_with, wait_for_audit_count};

fn tight_retry(max_attempts: u32) -> RetryContext {
    RetryContext::new(
        max_attempts,
        Duration::from_millis(50),
        Duration::from_millis(200),
    )
}

#[tokio::test]
async fn test_exhausted_retries_leave_exactly_max_plus_one_records() {
    let failing = FailingConsumer::always();
    let probe = failing.clone();
    let rig = rig_with(fast_config(), move |registry| {
        registry.register("failing", failing);
    });
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "doomed"), "failing", ScheduleType::Immediate)
                .with_retry(tight_retry(3)),
        )
        .await
        .unwrap();

    // Initial attempt plus three retries.
    wait_for_audit_count(&rig.audit, 4, Duration::from_secs(5)).await;

    // Give the engine room to misbehave, then confirm nothing else fired.
    tokio::time::sleep(Duration::from_millis(400)).await;
    rig.engine.stop(false).await.unwrap();

    assert_eq!(rig.audit.count().await.unwrap(), 4);
    assert_eq!(probe.attempts(), 4);
    assert_eq!(rig.store.count().await.unwrap(), 0);

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert!(records.iter().all(|r| r.outcome == TaskOutcome::Error));
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    let flaky = FailingConsumer::new(1);
    let rig = rig_with(fast_config(), move |registry| {
        registry.register("flaky", flaky);
    });
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "flaky"), "flaky", ScheduleType::Immediate)
                .with_retry(tight_retry(3)),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 2, Duration::from_secs(5)).await;
    rig.engine.stop(false).await.unwrap();

    // Newest first: the recovery success, then the initial failure.
    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, TaskOutcome::Success);
    assert_eq!(records[0].log.as_deref(), Some("recovered"));
    assert_eq!(records[1].outcome, TaskOutcome::Error);

    // One-shot task is consumed after its successful attempt.
    assert_eq!(rig.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_recurring_task_stays_on_cadence() {
    let failing = FailingConsumer::always();
    let rig = rig_with(fast_config(), move |registry| {
        registry.register("failing", failing);
    });
    rig.engine.start().await.unwrap();

    // A huge backoff base would push the next fire far out if retries
    // rescheduled recurring tasks; the cadence must win instead.
    rig.dispatcher
        .schedule(
            ScheduleRequest::new(
                TaskKey::new("g", "cron_fail"),
                "failing",
                ScheduleType::interval(0, 0, 0, 1).unwrap(),
            )
            .with_retry(RetryContext::new(
                3,
                Duration::from_secs(60),
                Duration::from_secs(600),
            )),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 2, Duration::from_secs(4)).await;
    rig.engine.stop(false).await.unwrap();

    let records = rig.audit.find_all(Page::default()).await.unwrap();
    assert!(records.iter().all(|r| r.outcome == TaskOutcome::Error));

    // Still bound, still on its schedule.
    let snapshot = rig
        .dispatcher
        .get(&TaskKey::new("g", "cron_fail"))
        .await
        .unwrap();
    assert!(snapshot.recurring);
    assert_eq!(snapshot.attempt, 0);
}

#[tokio::test]
async fn test_no_retry_context_fails_once() {
    let failing = FailingConsumer::always();
    let probe = failing.clone();
    let rig = rig_with(fast_config(), move |registry| {
        registry.register("failing", failing);
    });
    rig.engine.start().await.unwrap();

    rig.dispatcher
        .schedule(
            ScheduleRequest::new(TaskKey::new("g", "once"), "failing", ScheduleType::Immediate)
                .with_retry(RetryContext::none()),
        )
        .await
        .unwrap();

    wait_for_audit_count(&rig.audit, 1, Duration::from_secs(3)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.engine.stop(false).await.unwrap();

    assert_eq!(probe.attempts(), 1);
    assert_eq!(rig.audit.count().await.unwrap(), 1);
    assert_eq!(rig.store.count().await.unwrap(), 0);
}
