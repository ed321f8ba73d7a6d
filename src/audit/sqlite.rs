//! SQLite audit store.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::{AuditError, AuditRecord, AuditStore, Page, TaskOutcome};
use crate::core::types::{AuditId, GroupId, TaskId};
use crate::store::sqlite::{datetime_to_string, string_to_datetime};

/// SQLite audit store backend.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

type AuditRow = (
    String,         // audit_id
    String,         // group_id
    String,         // task_id
    String,         // node_id
    String,         // fire_time
    i64,            // run_time_ms
    String,         // outcome
    Option<String>, // log
    Option<String>, // detail
    bool,           // misfire
    String,         // created_at
);

impl SqliteAuditStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| AuditError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| AuditError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AuditError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| AuditError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Reuse the pool of an existing trigger store so both tables share one
    /// database file.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn run_migrations(&self) -> Result<(), AuditError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    fn row_to_record(row: AuditRow) -> Result<AuditRecord, AuditError> {
        let id = Uuid::parse_str(&row.0)
            .map(AuditId::from_uuid)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        Ok(AuditRecord {
            id,
            group_id: GroupId::new(row.1),
            task_id: TaskId::new(row.2),
            node_id: row.3,
            fire_time: string_to_datetime(&row.4),
            run_time_ms: row.5,
            outcome: string_to_outcome(&row.6),
            log: row.7,
            detail: row.8,
            misfire: row.9,
            created_at: string_to_datetime(&row.10),
        })
    }
}

fn outcome_to_string(outcome: TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Success => "success",
        TaskOutcome::Error => "error",
    }
}

fn string_to_outcome(s: &str) -> TaskOutcome {
    match s {
        "success" => TaskOutcome::Success,
        _ => TaskOutcome::Error,
    }
}

const SELECT_RECORD: &str = "SELECT audit_id, group_id, task_id, node_id, fire_time, \
     run_time_ms, outcome, log, detail, misfire, created_at FROM audit_log";

const ORDER_NEWEST_FIRST: &str = "ORDER BY CAST(fire_time AS INTEGER) DESC, seq DESC";

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn create(&self, record: AuditRecord) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (audit_id, group_id, task_id, node_id, fire_time,
                run_time_ms, outcome, log, detail, misfire, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.group_id.as_str())
        .bind(record.task_id.as_str())
        .bind(&record.node_id)
        .bind(datetime_to_string(record.fire_time))
        .bind(record.run_time_ms)
        .bind(outcome_to_string(record.outcome))
        .bind(&record.log)
        .bind(&record.detail)
        .bind(record.misfire)
        .bind(datetime_to_string(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Other(e.to_string()))?;
        Ok(())
    }

    async fn find_all(&self, page: Page) -> Result<Vec<AuditRecord>, AuditError> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "{} {} LIMIT ? OFFSET ?",
            SELECT_RECORD, ORDER_NEWEST_FIRST
        ))
        .bind(page.size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Other(e.to_string()))?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn find(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
        page: Page,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "{} WHERE group_id = ? AND task_id = ? {} LIMIT ? OFFSET ?",
            SELECT_RECORD, ORDER_NEWEST_FIRST
        ))
        .bind(group_id.as_str())
        .bind(task_id.as_str())
        .bind(page.size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Other(e.to_string()))?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn most_recent(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let row: Option<AuditRow> = sqlx::query_as(&format!(
            "{} WHERE group_id = ? AND task_id = ? {} LIMIT 1",
            SELECT_RECORD, ORDER_NEWEST_FIRST
        ))
        .bind(group_id.as_str())
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuditError::Other(e.to_string()))?;

        row.map(Self::row_to_record).transpose()
    }

    async fn count(&self) -> Result<u64, AuditError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuditError::Other(e.to_string()))?;
        Ok(row.0 as u64)
    }

    async fn count_for(&self, group_id: &GroupId, task_id: &TaskId) -> Result<u64, AuditError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE group_id = ? AND task_id = ?")
                .bind(group_id.as_str())
                .bind(task_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AuditError::Other(e.to_string()))?;
        Ok(row.0 as u64)
    }
}
