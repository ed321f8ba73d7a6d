//! Task dispatch: the scheduling-side API.
//!
//! The dispatcher validates schedule requests, computes the first fire
//! instant, and persists trigger bindings. It never executes anything;
//! execution is the engine's side of the store.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::retry::RetryContext;
use crate::core::schedule::{ScheduleError, ScheduleType};
use crate::core::types::{GroupId, TaskId, TaskKey};
use crate::store::{StoreError, TaskBinding, TaskSnapshot, TriggerStore};

/// Errors from scheduling-side operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A live binding already exists for the key.
    #[error("task already scheduled: {0}")]
    DuplicateTask(TaskKey),

    /// No binding exists for the key.
    #[error("task not found: {0}")]
    TaskNotFound(TaskKey),

    /// The request's schedule is malformed.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    /// The trigger store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A request to bind a task to a schedule.
///
/// Built incrementally; `parameters` is the flat bag handed to the
/// consumer's payload builder at every fire.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    key: TaskKey,
    consumer_type: String,
    schedule: ScheduleType,
    parameters: Map<String, Value>,
    start_at: Option<DateTime<Utc>>,
    retry: RetryContext,
    replace: bool,
}

impl ScheduleRequest {
    pub fn new(
        key: TaskKey,
        consumer_type: impl Into<String>,
        schedule: ScheduleType,
    ) -> Self {
        Self {
            key,
            consumer_type: consumer_type.into(),
            schedule,
            parameters: Map::new(),
            start_at: None,
            retry: RetryContext::default(),
            replace: false,
        }
    }

    /// Add one parameter to the bag.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replace the whole parameter bag.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Earliest instant the task may first fire. Without it, the schedule
    /// starts from the moment of dispatch.
    pub fn with_start_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_retry(mut self, retry: RetryContext) -> Self {
        self.retry = retry;
        self
    }

    /// Overwrite an existing binding for the same key instead of failing
    /// with [`DispatchError::DuplicateTask`].
    pub fn with_replace(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// Scheduling-side handle over a trigger store.
#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn TriggerStore>,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a schedule request, returning the bound key.
    ///
    /// Duplicate keys are rejected unless the request asked to replace;
    /// the store's uniqueness constraint decides races, so two concurrent
    /// calls for one key yield exactly one success.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<TaskKey, DispatchError> {
        request.schedule.validate()?;
        let now = Utc::now();
        let first_fire = request.schedule.first_fire_at(request.start_at, now)?;

        let binding = TaskBinding::new(
            request.key.clone(),
            request.consumer_type,
            request.schedule,
            request.parameters,
            first_fire,
            request.retry,
        );

        let stored = if request.replace {
            match self.store.update(binding.clone()).await {
                // Nothing to overwrite; fall through to a plain insert.
                Err(StoreError::NotFound(_)) => self.store.put(binding).await,
                other => other,
            }
        } else {
            self.store.put(binding).await
        };

        match stored {
            Ok(()) => {
                info!(
                    group_id = %request.key.group_id,
                    task_id = %request.key.task_id,
                    next_fire_at = %first_fire,
                    "task scheduled"
                );
                Ok(request.key)
            }
            Err(StoreError::DuplicateKey(_)) => {
                Err(DispatchError::DuplicateTask(request.key))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one binding, returning the number removed. Deleting a
    /// missing key removes nothing and is not an error.
    pub async fn delete(&self, key: &TaskKey) -> Result<u64, DispatchError> {
        let removed = self.store.delete(key).await?;
        debug!(group_id = %key.group_id, task_id = %key.task_id, removed, "task deleted");
        Ok(removed)
    }

    /// Delete every binding in a group, returning the number removed.
    /// The group's audit history is untouched.
    pub async fn delete_group(&self, group_id: &GroupId) -> Result<u64, DispatchError> {
        let removed = self.store.delete_group(group_id).await?;
        info!(group_id = %group_id, removed, "group deleted");
        Ok(removed)
    }

    /// Whether any live binding exists in the group.
    pub async fn group_exists(&self, group_id: &GroupId) -> Result<bool, DispatchError> {
        Ok(!self.store.query(Some(group_id)).await?.is_empty())
    }

    /// Keys of all live bindings in a group.
    pub async fn group_task_keys(&self, group_id: &GroupId) -> Result<Vec<TaskKey>, DispatchError> {
        Ok(self
            .store
            .query(Some(group_id))
            .await?
            .into_iter()
            .map(|b| b.key)
            .collect())
    }

    /// Pause a whole group, or one task within it, returning the number of
    /// bindings affected. Naming a missing task is an error; an empty group
    /// is not. In-flight executions finish; pausing stops future claims
    /// only.
    pub async fn pause(
        &self,
        group_id: &GroupId,
        task_id: Option<&TaskId>,
    ) -> Result<u64, DispatchError> {
        self.set_paused(group_id, task_id, true).await
    }

    /// Resume a whole group, or one task within it, returning the number of
    /// bindings affected.
    pub async fn resume(
        &self,
        group_id: &GroupId,
        task_id: Option<&TaskId>,
    ) -> Result<u64, DispatchError> {
        self.set_paused(group_id, task_id, false).await
    }

    async fn set_paused(
        &self,
        group_id: &GroupId,
        task_id: Option<&TaskId>,
        paused: bool,
    ) -> Result<u64, DispatchError> {
        let affected = match task_id {
            Some(task_id) => {
                let key = TaskKey {
                    group_id: group_id.clone(),
                    task_id: task_id.clone(),
                };
                let affected = self.store.set_paused(&key, paused).await?;
                if affected == 0 {
                    return Err(DispatchError::TaskNotFound(key));
                }
                affected
            }
            None => self.store.set_group_paused(group_id, paused).await?,
        };
        info!(group_id = %group_id, affected, paused, "pause state changed");
        Ok(affected)
    }

    /// Snapshots of live bindings, optionally restricted to one group.
    pub async fn all(&self, group_id: Option<&GroupId>) -> Result<Vec<TaskSnapshot>, DispatchError> {
        Ok(self
            .store
            .query(group_id)
            .await?
            .iter()
            .map(TaskBinding::snapshot)
            .collect())
    }

    /// Snapshot of one binding.
    pub async fn get(&self, key: &TaskKey) -> Result<TaskSnapshot, DispatchError> {
        match self.store.get(key).await {
            Ok(binding) => Ok(binding.snapshot()),
            Err(StoreError::NotFound(_)) => Err(DispatchError::TaskNotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Distinct groups with live bindings.
    pub async fn groups(&self) -> Result<Vec<GroupId>, DispatchError> {
        Ok(self.store.groups().await?)
    }

    /// Total live bindings.
    pub async fn count(&self) -> Result<u64, DispatchError> {
        Ok(self.store.count().await?)
    }
}
