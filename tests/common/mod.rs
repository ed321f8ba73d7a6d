//! Common test utilities shared across integration tests.

use std::sync::Arc;
use std::time::Duration;

use taskline::testing::RecordingConsumer;
use taskline::{
    AuditStore, ConsumerRegistry, EngineConfig, MemoryAuditStore, MemoryTriggerStore,
    SchedulerEngine, TaskDispatcher, TriggerStore,
};

/// A fully wired engine over in-memory backends, tuned for fast tests.
pub struct TestRig {
    pub engine: SchedulerEngine,
    pub dispatcher: TaskDispatcher,
    pub store: Arc<MemoryTriggerStore>,
    pub audit: Arc<MemoryAuditStore>,
    pub recorder: RecordingConsumer,
}

/// Engine config with a tight tick so tests settle quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(4)
        .with_tick_interval(Duration::from_millis(25))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_node_id("node-test")
}

/// Build a rig with the default config and a "recording" consumer.
pub fn rig() -> TestRig {
    rig_with(fast_config(), |_| {})
}

/// Build a rig with a custom config, letting the caller register extra
/// consumers.
pub fn rig_with(config: EngineConfig, customize: impl FnOnce(&mut ConsumerRegistry)) -> TestRig {
    let store = Arc::new(MemoryTriggerStore::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let recorder = RecordingConsumer::new();

    let mut registry = ConsumerRegistry::new();
    registry.register("recording", recorder.clone());
    customize(&mut registry);

    let trigger_store: Arc<dyn TriggerStore> = store.clone();
    let audit_store: Arc<dyn AuditStore> = audit.clone();
    let engine = SchedulerEngine::new(Arc::clone(&trigger_store), registry)
        .with_audit_store(audit_store)
        .with_config(config);
    let dispatcher = TaskDispatcher::new(trigger_store);

    TestRig {
        engine,
        dispatcher,
        store,
        audit,
        recorder,
    }
}

/// Poll the audit store until it holds `expected` records.
///
/// # Panics
///
/// Panics if the timeout is reached first, reporting the count seen.
pub async fn wait_for_audit_count(audit: &MemoryAuditStore, expected: u64, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let count = audit.count().await.unwrap();
        if count >= expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} audit records, saw {}",
                expected, count
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the trigger store until it holds `expected` live bindings.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_store_count(store: &MemoryTriggerStore, expected: u64, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let count = store.count().await.unwrap();
        if count == expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} live bindings, saw {}",
                expected, count
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
