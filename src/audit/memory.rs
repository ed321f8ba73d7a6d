//! In-memory audit store.

use async_trait::async_trait;
use std::sync::RwLock;

use super::{AuditError, AuditRecord, AuditStore, Page};
use crate::core::types::{GroupId, TaskId};

/// In-memory audit store for tests and development.
///
/// Keeps an insertion sequence alongside each record so newest-first
/// ordering is stable when fire times collide.
pub struct MemoryAuditStore {
    records: RwLock<Vec<(u64, AuditRecord)>>,
    next_seq: RwLock<u64>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_seq: RwLock::new(0),
        }
    }

    fn sorted_matching<F>(&self, filter: F) -> Result<Vec<AuditRecord>, AuditError>
    where
        F: Fn(&AuditRecord) -> bool,
    {
        let records = self.records.read().map_err(|_| AuditError::LockPoisoned)?;
        let mut matching: Vec<(u64, AuditRecord)> = records
            .iter()
            .filter(|(_, r)| filter(r))
            .cloned()
            .collect();
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.fire_time.cmp(&a.fire_time).then(seq_b.cmp(seq_a))
        });
        Ok(matching.into_iter().map(|(_, r)| r).collect())
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

fn page_slice(records: Vec<AuditRecord>, page: Page) -> Vec<AuditRecord> {
    records
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.size as usize)
        .collect()
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn create(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut next_seq = self.next_seq.write().map_err(|_| AuditError::LockPoisoned)?;
        let mut records = self.records.write().map_err(|_| AuditError::LockPoisoned)?;
        records.push((*next_seq, record));
        *next_seq += 1;
        Ok(())
    }

    async fn find_all(&self, page: Page) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(page_slice(self.sorted_matching(|_| true)?, page))
    }

    async fn find(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
        page: Page,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let records =
            self.sorted_matching(|r| r.group_id == *group_id && r.task_id == *task_id)?;
        Ok(page_slice(records, page))
    }

    async fn most_recent(
        &self,
        group_id: &GroupId,
        task_id: &TaskId,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let records =
            self.sorted_matching(|r| r.group_id == *group_id && r.task_id == *task_id)?;
        Ok(records.into_iter().next())
    }

    async fn count(&self) -> Result<u64, AuditError> {
        let records = self.records.read().map_err(|_| AuditError::LockPoisoned)?;
        Ok(records.len() as u64)
    }

    async fn count_for(&self, group_id: &GroupId, task_id: &TaskId) -> Result<u64, AuditError> {
        let records = self.records.read().map_err(|_| AuditError::LockPoisoned)?;
        Ok(records
            .iter()
            .filter(|(_, r)| r.group_id == *group_id && r.task_id == *task_id)
            .count() as u64)
    }
}
