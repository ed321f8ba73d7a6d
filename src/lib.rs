//! Taskline: a task scheduling and execution engine.
//!
//! Tasks are bound to triggers through a [`dispatch::TaskDispatcher`],
//! persisted in a [`store::TriggerStore`], and executed by a
//! [`engine::SchedulerEngine`] that resolves registered
//! [`consumer::TaskConsumer`]s. Every attempt lands in an append-only
//! audit trail and on a best-effort event stream.

pub mod audit;
pub mod consumer;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod store;
pub mod testing;

pub use crate::audit::{AuditRecord, AuditService, AuditStore, MemoryAuditStore, Page, TaskOutcome};
pub use crate::consumer::{
    ConsumerError, ConsumerRegistry, ConsumerRunner, TaskConsumer, TaskProperties,
};
pub use crate::core::retry::RetryContext;
pub use crate::core::schedule::{ScheduleError, ScheduleType};
pub use crate::core::types::{AuditId, GroupId, TaskId, TaskKey};
pub use crate::dispatch::{DispatchError, ScheduleRequest, TaskDispatcher};
pub use crate::engine::{
    EngineConfig, EngineError, EngineHealth, EngineState, SchedulerEngine, StateTransition,
};
pub use crate::events::EventBus;
pub use crate::store::{MemoryTriggerStore, TaskBinding, TaskSnapshot, TaskState, TriggerStore};

#[cfg(any(feature = "sqlite", test))]
pub use crate::audit::SqliteAuditStore;
#[cfg(any(feature = "sqlite", test))]
pub use crate::store::SqliteTriggerStore;
