//! Append-only audit trail of task executions.
//!
//! Every attempt, success or failure, produces exactly one
//! [`AuditRecord`]. Records are written off the execution path through a
//! bounded queue so a slow audit backend can never stall task workers; a
//! full queue drops the record with a warning rather than blocking.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::MemoryAuditStore;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteAuditStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::core::types::{AuditId, GroupId, TaskId};

/// Errors from the audit trail.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Audit store lock was poisoned.
    #[error("audit store lock poisoned")]
    LockPoisoned,

    /// Generic audit store error.
    #[error("audit store error: {0}")]
    Other(String),
}

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Error,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "SUCCESS",
            TaskOutcome::Error => "ERROR",
        }
    }
}

/// One execution attempt, recorded after the attempt settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id.
    pub id: AuditId,
    pub group_id: GroupId,
    pub task_id: TaskId,
    /// Identifier of the node that ran the attempt.
    pub node_id: String,
    /// The scheduled fire instant the attempt served.
    pub fire_time: DateTime<Utc>,
    /// Wall-clock duration of the attempt in milliseconds.
    pub run_time_ms: i64,
    pub outcome: TaskOutcome,
    /// Output captured from the consumer, if any.
    pub log: Option<String>,
    /// Error detail on failure.
    pub detail: Option<String>,
    /// Whether the attempt served a fire instant past the misfire
    /// threshold.
    pub misfire: bool,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record for an attempt that just settled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: GroupId,
        task_id: TaskId,
        node_id: impl Into<String>,
        fire_time: DateTime<Utc>,
        run_time_ms: i64,
        outcome: TaskOutcome,
        log: Option<String>,
        detail: Option<String>,
        misfire: bool,
    ) -> Self {
        Self {
            id: AuditId::new(),
            group_id,
            task_id,
            node_id: node_id.into(),
            fire_time,
            run_time_ms,
            outcome,
            log,
            detail,
            misfire,
            created_at: Utc::now(),
        }
    }
}

/// Paging window for audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Zero-based page number.
    pub number: u64,
    /// Records per page.
    pub size: u64,
}

impl Page {
    pub fn new(number: u64, size: u64) -> Self {
        Self { number, size }
    }

    pub fn offset(&self) -> u64 {
        self.number * self.size
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 0,
            size: 100,
        }
    }
}

/// Append-only store of execution records.
///
/// Queries return newest-first: fire time descending, insertion order
/// breaking ties.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record.
    async fn create(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// All records, newest first, paged.
    async fn find_all(&self, page: Page) -> Result<Vec<AuditRecord>, AuditError>;

    /// Records for one task, newest first, paged.
    async fn find(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
        page: Page,
    ) -> Result<Vec<AuditRecord>, AuditError>;

    /// Most recent record for one task, if any.
    async fn most_recent(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
    ) -> Result<Option<AuditRecord>, AuditError>;

    /// Total number of records.
    async fn count(&self) -> Result<u64, AuditError>;

    /// Number of records for one task.
    async fn count_for(&self, group_id: &GroupId, task_id: &TaskId) -> Result<u64, AuditError>;
}

/// Default capacity of the audit write queue.
pub const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 1024;

enum QueueItem {
    Record(AuditRecord),
    Drain(tokio::sync::oneshot::Sender<()>),
}

/// Asynchronous front for an [`AuditStore`].
///
/// Records are queued with a non-blocking send and written by a
/// background task. Reads go straight to the store.
pub struct AuditService {
    store: Arc<dyn AuditStore>,
    tx: mpsc::Sender<QueueItem>,
    writer: JoinHandle<()>,
}

impl AuditService {
    /// Spawn the background writer over the given store.
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self::with_capacity(store, DEFAULT_AUDIT_QUEUE_CAPACITY)
    }

    /// Spawn with an explicit queue capacity.
    pub fn with_capacity(store: Arc<dyn AuditStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueueItem>(capacity);
        let writer_store = Arc::clone(&store);
        let writer = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    QueueItem::Record(record) => {
                        if let Err(e) = writer_store.create(record).await {
                            error!(error = %e, "failed to persist audit record");
                        }
                    }
                    QueueItem::Drain(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { store, tx, writer }
    }

    /// Queue a record for writing. Never blocks; if the queue is full or
    /// the writer has stopped the record is dropped and a warning logged.
    pub fn record(&self, record: AuditRecord) {
        match self.tx.try_send(QueueItem::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(QueueItem::Record(r))) => {
                warn!(
                    group_id = %r.group_id,
                    task_id = %r.task_id,
                    "audit queue full, dropping record"
                );
            }
            Err(mpsc::error::TrySendError::Closed(QueueItem::Record(r))) => {
                warn!(
                    group_id = %r.group_id,
                    task_id = %r.task_id,
                    "audit writer stopped, dropping record"
                );
            }
            Err(_) => {}
        }
    }

    /// Wait until every record queued so far has been written. Records
    /// queued afterwards are unaffected.
    pub async fn drain(&self) {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(QueueItem::Drain(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stop the writer after draining queued records.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            error!(error = %e, "audit writer task failed");
        }
    }

    pub async fn find_all(&self, page: Page) -> Result<Vec<AuditRecord>, AuditError> {
        self.store.find_all(page).await
    }

    pub async fn find(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
        page: Page,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.store.find(group_id, task_id, page).await
    }

    pub async fn most_recent(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
    ) -> Result<Option<AuditRecord>, AuditError> {
        self.store.most_recent(group_id, task_id).await
    }

    pub async fn count(&self) -> Result<u64, AuditError> {
        self.store.count().await
    }

    pub async fn count_for(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
    ) -> Result<u64, AuditError> {
        self.store.count_for(group_id, task_id).await
    }
}
