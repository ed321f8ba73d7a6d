//! Trigger store abstraction: durable task → trigger → payload bindings.
//!
//! The store is the source of the uniqueness guarantee (at most one live
//! binding per [`TaskKey`]) and of the single-flight guarantee (a binding
//! claimed as `Firing` is never handed out again until released).
//!
//! Backends: in-memory for tests and development, sqlite for durability.

mod memory;
#[cfg(any(feature = "sqlite", test))]
pub(crate) mod sqlite;

pub use memory::MemoryTriggerStore;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteTriggerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::retry::RetryContext;
use crate::core::schedule::ScheduleType;
use crate::core::types::{GroupId, TaskKey};

/// Errors that can occur during trigger store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested binding was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A binding already exists for the key.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Store lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store is unreachable.
    #[error("trigger store unavailable: {0}")]
    Unavailable(String),

    /// Generic store error.
    #[error("store error: {0}")]
    Other(String),
}

/// Lifecycle state of a trigger binding.
///
/// `paused` is tracked separately: pausing suspends claiming without
/// losing the binding or its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Scheduled and claimable when due.
    Normal,
    /// Claimed by the engine; an execution is in flight.
    Firing,
}

/// One live trigger binding: everything needed to fire a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBinding {
    /// Unique task key.
    pub key: TaskKey,
    /// Consumer-type tag resolved through the consumer registry.
    pub consumer_type: String,
    /// Schedule driving fire instants.
    pub schedule: ScheduleType,
    /// Flat parameter bag handed to the consumer's payload builder.
    pub parameters: Map<String, Value>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Whether firing is suspended.
    pub paused: bool,
    /// Next absolute fire instant.
    pub next_fire_at: DateTime<Utc>,
    /// Retry state, persisted with the binding so it survives restarts.
    pub retry: RetryContext,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
}

impl TaskBinding {
    /// Create a new binding in the `Normal` state.
    pub fn new(
        key: TaskKey,
        consumer_type: impl Into<String>,
        schedule: ScheduleType,
        parameters: Map<String, Value>,
        next_fire_at: DateTime<Utc>,
        retry: RetryContext,
    ) -> Self {
        Self {
            key,
            consumer_type: consumer_type.into(),
            schedule,
            parameters,
            state: TaskState::Normal,
            paused: false,
            next_fire_at,
            retry,
            created_at: Utc::now(),
        }
    }

    /// Read-only view for listings and health reporting.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key.clone(),
            consumer_type: self.consumer_type.clone(),
            schedule: self.schedule.expression(),
            recurring: self.schedule.is_recurring(),
            state: self.state,
            paused: self.paused,
            next_fire_at: self.next_fire_at,
            attempt: self.retry.attempt,
            max_attempts: self.retry.max_attempts,
            created_at: self.created_at,
        }
    }
}

/// Point-in-time view of one binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub key: TaskKey,
    pub consumer_type: String,
    pub schedule: String,
    pub recurring: bool,
    pub state: TaskState,
    pub paused: bool,
    pub next_fire_at: DateTime<Utc>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Durable store of trigger bindings.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Insert a new binding. Fails with [`StoreError::DuplicateKey`] if a
    /// binding already exists for the key; concurrent inserts racing on the
    /// same key are serialized here, not by application locking.
    async fn put(&self, binding: TaskBinding) -> Result<(), StoreError>;

    /// Overwrite an existing binding in place, keeping the key. This is the
    /// dispatcher's replace path; fails with [`StoreError::NotFound`] if no
    /// binding exists for the key.
    async fn update(&self, binding: TaskBinding) -> Result<(), StoreError>;

    /// Fetch one binding.
    async fn get(&self, key: &TaskKey) -> Result<TaskBinding, StoreError>;

    /// List bindings, optionally restricted to one group, ordered by
    /// creation time.
    async fn query(&self, group_id: Option<&GroupId>) -> Result<Vec<TaskBinding>, StoreError>;

    /// Delete one binding. Returns the number removed (0 or 1); deleting a
    /// missing key is not an error.
    async fn delete(&self, key: &TaskKey) -> Result<u64, StoreError>;

    /// Delete every binding in a group, returning the number removed.
    async fn delete_group(&self, group_id: &GroupId) -> Result<u64, StoreError>;

    /// Set the paused flag on one binding, returning 1 if it existed.
    async fn set_paused(&self, key: &TaskKey, paused: bool) -> Result<u64, StoreError>;

    /// Set the paused flag on every binding in a group, returning the
    /// number affected.
    async fn set_group_paused(&self, group_id: &GroupId, paused: bool)
    -> Result<u64, StoreError>;

    /// Atomically claim up to `limit` due bindings: `Normal`, not paused,
    /// `next_fire_at <= now`. Claimed bindings transition to `Firing` and
    /// are not handed out again until released, which is what enforces
    /// at-most-one in-flight execution per key.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskBinding>, StoreError>;

    /// Release a claimed binding after its execution settles.
    ///
    /// `Some(next_fire)` re-arms the binding as `Normal` with the given
    /// fire instant and retry state; `None` removes it (one-shot complete
    /// or retries exhausted). Releasing a key deleted mid-flight is a
    /// no-op.
    async fn release(
        &self,
        key: &TaskKey,
        next_fire_at: Option<DateTime<Utc>>,
        retry: RetryContext,
    ) -> Result<(), StoreError>;

    /// Re-arm bindings left in `Firing` by an interrupted process,
    /// returning the number recovered.
    async fn recover(&self) -> Result<u64, StoreError>;

    /// Distinct group ids with at least one live binding, sorted.
    async fn groups(&self) -> Result<Vec<GroupId>, StoreError>;

    /// Total number of live bindings.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Cheap reachability check, used by the engine at startup.
    async fn ping(&self) -> Result<(), StoreError>;
}
