//! Best-effort event stream of scheduler activity.
//!
//! Execution workers publish one human-readable line per settled attempt.
//! Delivery is lossy on purpose: a slow or absent subscriber never blocks
//! the engine, and a bounded replay buffer lets late subscribers catch up
//! on recent activity.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// Default number of events a subscriber can lag behind before losing
/// messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default number of past events replayed to new subscribers.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Fan-out bus for scheduler event lines.
pub struct EventBus {
    sender: broadcast::Sender<String>,
    replay: Mutex<VecDeque<String>>,
    replay_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, DEFAULT_REPLAY_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize, replay_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
            replay_capacity,
        }
    }

    /// Publish one event line. Never fails; with no subscribers the line
    /// still lands in the replay buffer.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        match self.replay.lock() {
            Ok(mut replay) => {
                while replay.len() >= self.replay_capacity {
                    replay.pop_front();
                }
                replay.push_back(line.clone());
            }
            Err(_) => warn!("event replay buffer lock poisoned"),
        }
        // A send error just means nobody is listening right now.
        let _ = self.sender.send(line);
    }

    /// Format and publish the line for a successful attempt.
    pub fn publish_consumed(&self, consumer_type: &str, group_id: &str, task_id: &str) {
        let line = format!(
            "{} | Consumed task type '{}' | Group Id: {} | Task Id: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            consumer_type,
            group_id,
            task_id
        );
        self.publish(line);
    }

    /// Format and publish the line for a failed attempt, carrying the
    /// error detail.
    pub fn publish_failed(&self, consumer_type: &str, group_id: &str, task_id: &str, error: &str) {
        let line = format!(
            "{} | Failed to consume task type '{}' | Group Id: {} | Task Id: {} | Error: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            consumer_type,
            group_id,
            task_id,
            error
        );
        self.publish(line);
    }

    /// Subscribe to the stream, returning buffered recent events plus a
    /// receiver for everything published afterwards.
    pub fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let receiver = self.sender.subscribe();
        let backlog = match self.replay.lock() {
            Ok(replay) => replay.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        (backlog, receiver)
    }

    /// Discard the replay buffer. Live subscriptions are unaffected.
    pub fn clear(&self) {
        if let Ok(mut replay) = self.replay.lock() {
            replay.clear();
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
