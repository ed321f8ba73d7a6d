//! SQLite trigger store.
//!
//! Durable backend with automatic schema migration. The primary-key
//! constraint on `(group_id, task_id)` is what serializes racing schedule
//! calls, and claims use conditional updates so a binding is only ever
//! handed to one worker.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{StoreError, TaskBinding, TaskState, TriggerStore};
use crate::core::retry::RetryContext;
use crate::core::schedule::ScheduleType;
use crate::core::types::{GroupId, TaskKey};

/// SQLite trigger store backend.
pub struct SqliteTriggerStore {
    pool: SqlitePool,
}

type BindingRow = (
    String,         // group_id
    String,         // task_id
    String,         // consumer_type
    String,         // schedule JSON
    String,         // parameters JSON
    String,         // state
    bool,           // paused
    String,         // next_fire_at
    i64,            // retry_attempt
    i64,            // retry_max_attempts
    i64,            // retry_backoff_base_ms
    i64,            // retry_backoff_cap_ms
    String,         // created_at
);

impl SqliteTriggerStore {
    /// Open (or create) a database file and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_binding(row: BindingRow) -> Result<TaskBinding, StoreError> {
        let schedule: ScheduleType = serde_json::from_str(&row.3)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let parameters = serde_json::from_str(&row.4)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(TaskBinding {
            key: TaskKey::new(row.0, row.1),
            consumer_type: row.2,
            schedule,
            parameters,
            state: string_to_state(&row.5),
            paused: row.6,
            next_fire_at: string_to_datetime(&row.7),
            retry: RetryContext {
                attempt: row.8 as u32,
                max_attempts: row.9 as u32,
                backoff_base: Duration::from_millis(row.10 as u64),
                backoff_cap: Duration::from_millis(row.11 as u64),
            },
            created_at: string_to_datetime(&row.12),
        })
    }
}

pub(crate) fn datetime_to_string(dt: DateTime<Utc>) -> String {
    dt.timestamp_millis().to_string()
}

pub(crate) fn string_to_datetime(s: &str) -> DateTime<Utc> {
    s.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

fn state_to_string(state: TaskState) -> &'static str {
    match state {
        TaskState::Normal => "normal",
        TaskState::Firing => "firing",
    }
}

fn string_to_state(s: &str) -> TaskState {
    match s {
        "firing" => TaskState::Firing,
        _ => TaskState::Normal,
    }
}

const SELECT_BINDING: &str = "SELECT group_id, task_id, consumer_type, schedule, parameters, \
     state, paused, next_fire_at, retry_attempt, retry_max_attempts, \
     retry_backoff_base_ms, retry_backoff_cap_ms, created_at FROM triggers";

#[async_trait]
impl TriggerStore for SqliteTriggerStore {
    async fn put(&self, binding: TaskBinding) -> Result<(), StoreError> {
        let schedule = serde_json::to_string(&binding.schedule)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let parameters = serde_json::to_string(&binding.parameters)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO triggers (group_id, task_id, consumer_type, schedule, parameters,
                state, paused, next_fire_at, retry_attempt, retry_max_attempts,
                retry_backoff_base_ms, retry_backoff_cap_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(binding.key.group_id.as_str())
        .bind(binding.key.task_id.as_str())
        .bind(&binding.consumer_type)
        .bind(&schedule)
        .bind(&parameters)
        .bind(state_to_string(binding.state))
        .bind(binding.paused)
        .bind(datetime_to_string(binding.next_fire_at))
        .bind(binding.retry.attempt as i64)
        .bind(binding.retry.max_attempts as i64)
        .bind(binding.retry.backoff_base.as_millis() as i64)
        .bind(binding.retry.backoff_cap.as_millis() as i64)
        .bind(datetime_to_string(binding.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateKey(binding.key.to_string()))
            }
            Err(e) => Err(StoreError::Other(e.to_string())),
        }
    }

    async fn update(&self, binding: TaskBinding) -> Result<(), StoreError> {
        let schedule = serde_json::to_string(&binding.schedule)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let parameters = serde_json::to_string(&binding.parameters)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE triggers SET consumer_type = ?, schedule = ?, parameters = ?,
                state = ?, paused = ?, next_fire_at = ?, retry_attempt = ?,
                retry_max_attempts = ?, retry_backoff_base_ms = ?, retry_backoff_cap_ms = ?
            WHERE group_id = ? AND task_id = ?
            "#,
        )
        .bind(&binding.consumer_type)
        .bind(&schedule)
        .bind(&parameters)
        .bind(state_to_string(binding.state))
        .bind(binding.paused)
        .bind(datetime_to_string(binding.next_fire_at))
        .bind(binding.retry.attempt as i64)
        .bind(binding.retry.max_attempts as i64)
        .bind(binding.retry.backoff_base.as_millis() as i64)
        .bind(binding.retry.backoff_cap.as_millis() as i64)
        .bind(binding.key.group_id.as_str())
        .bind(binding.key.task_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(binding.key.to_string()));
        }
        Ok(())
    }

    async fn get(&self, key: &TaskKey) -> Result<TaskBinding, StoreError> {
        let row: Option<BindingRow> =
            sqlx::query_as(&format!("{} WHERE group_id = ? AND task_id = ?", SELECT_BINDING))
                .bind(key.group_id.as_str())
                .bind(key.task_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Other(e.to_string()))?;

        let row = row.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::row_to_binding(row)
    }

    async fn query(&self, group_id: Option<&GroupId>) -> Result<Vec<TaskBinding>, StoreError> {
        let rows: Vec<BindingRow> = match group_id {
            Some(group) => {
                sqlx::query_as(&format!(
                    "{} WHERE group_id = ? ORDER BY created_at",
                    SELECT_BINDING
                ))
                .bind(group.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!("{} ORDER BY created_at", SELECT_BINDING))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Other(e.to_string()))?;

        rows.into_iter().map(Self::row_to_binding).collect()
    }

    async fn delete(&self, key: &TaskKey) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM triggers WHERE group_id = ? AND task_id = ?")
            .bind(key.group_id.as_str())
            .bind(key.task_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_group(&self, group_id: &GroupId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM triggers WHERE group_id = ?")
            .bind(group_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn set_paused(&self, key: &TaskKey, paused: bool) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE triggers SET paused = ? WHERE group_id = ? AND task_id = ?")
                .bind(paused)
                .bind(key.group_id.as_str())
                .bind(key.task_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn set_group_paused(
        &self,
        group_id: &GroupId,
        paused: bool,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE triggers SET paused = ? WHERE group_id = ?")
            .bind(paused)
            .bind(group_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskBinding>, StoreError> {
        let now_str = datetime_to_string(now);
        let rows: Vec<BindingRow> = sqlx::query_as(&format!(
            "{} WHERE state = 'normal' AND paused = 0 AND CAST(next_fire_at AS INTEGER) <= ? \
             ORDER BY CAST(next_fire_at AS INTEGER) LIMIT ?",
            SELECT_BINDING
        ))
        .bind(&now_str)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Other(e.to_string()))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let binding = Self::row_to_binding(row)?;
            // Conditional update: only the caller that flips the state gets
            // the claim, so a concurrent claimer cannot double-fire a key.
            let result = sqlx::query(
                "UPDATE triggers SET state = 'firing' \
                 WHERE group_id = ? AND task_id = ? AND state = 'normal'",
            )
            .bind(binding.key.group_id.as_str())
            .bind(binding.key.task_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;

            if result.rows_affected() == 1 {
                let mut binding = binding;
                binding.state = TaskState::Firing;
                claimed.push(binding);
            }
        }
        Ok(claimed)
    }

    async fn release(
        &self,
        key: &TaskKey,
        next_fire_at: Option<DateTime<Utc>>,
        retry: RetryContext,
    ) -> Result<(), StoreError> {
        match next_fire_at {
            Some(next) => {
                sqlx::query(
                    "UPDATE triggers SET state = 'normal', next_fire_at = ?, retry_attempt = ? \
                     WHERE group_id = ? AND task_id = ?",
                )
                .bind(datetime_to_string(next))
                .bind(retry.attempt as i64)
                .bind(key.group_id.as_str())
                .bind(key.task_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Other(e.to_string()))?;
            }
            None => {
                sqlx::query("DELETE FROM triggers WHERE group_id = ? AND task_id = ?")
                    .bind(key.group_id.as_str())
                    .bind(key.task_id.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Other(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn recover(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE triggers SET state = 'normal' WHERE state = 'firing'")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn groups(&self) -> Result<Vec<GroupId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT group_id FROM triggers ORDER BY group_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(rows.into_iter().map(|(g,)| GroupId::new(g)).collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM triggers")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(row.0 as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
