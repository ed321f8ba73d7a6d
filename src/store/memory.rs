//! In-memory trigger store.
//!
//! Thread-safe backend for testing and development. Bindings are not
//! persisted across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{StoreError, TaskBinding, TaskState, TriggerStore};
use crate::core::retry::RetryContext;
use crate::core::types::{GroupId, TaskKey};

/// In-memory trigger store backend.
pub struct MemoryTriggerStore {
    bindings: RwLock<HashMap<TaskKey, TaskBinding>>,
}

impl MemoryTriggerStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTriggerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn put(&self, binding: TaskBinding) -> Result<(), StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        if bindings.contains_key(&binding.key) {
            return Err(StoreError::DuplicateKey(binding.key.to_string()));
        }
        bindings.insert(binding.key.clone(), binding);
        Ok(())
    }

    async fn update(&self, binding: TaskBinding) -> Result<(), StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        if !bindings.contains_key(&binding.key) {
            return Err(StoreError::NotFound(binding.key.to_string()));
        }
        bindings.insert(binding.key.clone(), binding);
        Ok(())
    }

    async fn get(&self, key: &TaskKey) -> Result<TaskBinding, StoreError> {
        let bindings = self.bindings.read().map_err(|_| StoreError::LockPoisoned)?;
        bindings
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn query(&self, group_id: Option<&GroupId>) -> Result<Vec<TaskBinding>, StoreError> {
        let bindings = self.bindings.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut result: Vec<_> = bindings
            .values()
            .filter(|b| group_id.is_none_or(|g| &b.key.group_id == g))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn delete(&self, key: &TaskKey) -> Result<u64, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(bindings.remove(key).map_or(0, |_| 1))
    }

    async fn delete_group(&self, group_id: &GroupId) -> Result<u64, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let before = bindings.len();
        bindings.retain(|key, _| &key.group_id != group_id);
        Ok((before - bindings.len()) as u64)
    }

    async fn set_paused(&self, key: &TaskKey, paused: bool) -> Result<u64, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        match bindings.get_mut(key) {
            Some(binding) => {
                binding.paused = paused;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn set_group_paused(
        &self,
        group_id: &GroupId,
        paused: bool,
    ) -> Result<u64, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut affected = 0;
        for binding in bindings.values_mut() {
            if &binding.key.group_id == group_id {
                binding.paused = paused;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskBinding>, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        let mut due: Vec<TaskKey> = bindings
            .values()
            .filter(|b| b.state == TaskState::Normal && !b.paused && b.next_fire_at <= now)
            .map(|b| b.key.clone())
            .collect();
        // Oldest fire time first, so starved triggers catch up first.
        due.sort_by_key(|key| bindings[key].next_fire_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for key in due {
            if let Some(binding) = bindings.get_mut(&key) {
                binding.state = TaskState::Firing;
                claimed.push(binding.clone());
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
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        match next_fire_at {
            Some(next) => {
                // The key may have been deleted while the execution ran.
                if let Some(binding) = bindings.get_mut(key) {
                    binding.state = TaskState::Normal;
                    binding.next_fire_at = next;
                    binding.retry = retry;
                }
            }
            None => {
                bindings.remove(key);
            }
        }
        Ok(())
    }

    async fn recover(&self) -> Result<u64, StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut recovered = 0;
        for binding in bindings.values_mut() {
            if binding.state == TaskState::Firing {
                binding.state = TaskState::Normal;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn groups(&self) -> Result<Vec<GroupId>, StoreError> {
        let bindings = self.bindings.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut groups: Vec<GroupId> = bindings.keys().map(|k| k.group_id.clone()).collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let bindings = self.bindings.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(bindings.len() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
