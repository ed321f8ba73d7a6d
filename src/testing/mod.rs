//! Testing utilities for users of the taskline library.
//!
//! This module provides consumer helpers for exercising the engine:
//!
//! - [`RecordingConsumer`]: captures the `value` parameter of every fire
//! - [`FailingConsumer`]: fails the first N attempts, then succeeds
//! - [`wait_until`]: polls an async condition with a timeout

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::consumer::{ConsumerError, TaskConsumer, TaskProperties};

/// A consumer that records the `value` parameter of every execution.
///
/// Clone-cheap: clones share the same recorded list, so a test can keep
/// one handle while the registry owns the other.
///
/// # Example
///
/// ```
/// use taskline::testing::RecordingConsumer;
///
/// let consumer = RecordingConsumer::new();
/// let seen = consumer.seen_handle();
/// // register `consumer`, run the engine, then:
/// assert!(seen.lock().unwrap().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct RecordingConsumer {
    seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values consumed so far, in execution order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("lock poisoned").clone()
    }

    /// Number of completed executions.
    pub fn count(&self) -> usize {
        self.seen.lock().expect("lock poisoned").len()
    }

    /// Shared handle to the recorded list.
    pub fn seen_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl TaskConsumer for RecordingConsumer {
    type Payload = String;

    fn build_payload(&self, properties: &TaskProperties) -> Result<String, ConsumerError> {
        properties.string("value")
    }

    async fn consume(&self, payload: String) -> Result<Option<String>, ConsumerError> {
        self.seen.lock().expect("lock poisoned").push(payload);
        Ok(None)
    }
}

/// A consumer that fails its first `fail_times` attempts, then succeeds.
///
/// With `fail_times` of `u32::MAX` it never succeeds, which is the shape
/// needed for retry-exhaustion tests.
#[derive(Clone)]
pub struct FailingConsumer {
    fail_times: u32,
    attempts: Arc<AtomicU32>,
}

impl FailingConsumer {
    pub fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A consumer that always fails.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Total attempts observed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskConsumer for FailingConsumer {
    type Payload = ();

    fn build_payload(&self, _properties: &TaskProperties) -> Result<(), ConsumerError> {
        Ok(())
    }

    async fn consume(&self, _payload: ()) -> Result<Option<String>, ConsumerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            Err(ConsumerError::Execution(format!(
                "induced failure on attempt {}",
                attempt + 1
            )))
        } else {
            Ok(Some("recovered".to_string()))
        }
    }
}

/// Poll `condition` every 25ms until it returns true or `timeout` elapses.
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
