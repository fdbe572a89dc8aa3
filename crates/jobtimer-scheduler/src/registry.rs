//! In-process bookkeeping of live timer registrations.
//!
//! The registry only mirrors what this process currently has armed. It is
//! never persisted; after a restart the loader rebuilds it from the
//! repository, so a missing entry is never an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::TimerHandle;

/// A live timer registration held by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerControlRecord {
    pub job_id: String,
    pub handle: TimerHandle,
    pub registered_at: DateTime<Utc>,
}

/// Concurrent map of job id to its live timer registration.
#[derive(Debug, Default)]
pub struct SchedulerControlRegistry {
    records: DashMap<String, SchedulerControlRecord>,
}

impl SchedulerControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration, returning the one it replaced.
    pub fn insert(&self, job_id: &str, handle: TimerHandle) -> Option<SchedulerControlRecord> {
        self.records.insert(
            job_id.to_string(),
            SchedulerControlRecord {
                job_id: job_id.to_string(),
                handle,
                registered_at: Utc::now(),
            },
        )
    }

    pub fn get(&self, job_id: &str) -> Option<SchedulerControlRecord> {
        self.records.get(job_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.records.contains_key(job_id)
    }

    pub fn remove(&self, job_id: &str) -> Option<SchedulerControlRecord> {
        self.records.remove(job_id).map(|(_, record)| record)
    }

    /// Remove the entry only if it still points at `handle`.
    pub fn remove_if_handle(&self, job_id: &str, handle: &TimerHandle) -> bool {
        self.records
            .remove_if(job_id, |_, record| &record.handle == handle)
            .is_some()
    }

    /// Empty the registry, returning every record it held.
    pub fn drain(&self) -> Vec<SchedulerControlRecord> {
        let keys: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.into_iter().filter_map(|k| self.remove(&k)).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One async mutex per job id, created on demand.
///
/// Serializes all operations on a given id while leaving different ids
/// independent. Entries are dropped again once nobody holds or waits on
/// them.
#[derive(Debug, Default)]
pub(crate) struct JobLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JobLocks {
    pub(crate) async fn lock(&self, job_id: &str) -> JobGuard<'_> {
        let mutex = Arc::clone(
            self.locks
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = mutex.lock_owned().await;
        JobGuard {
            locks: self,
            job_id: job_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held for the duration of one operation on a job id.
pub(crate) struct JobGuard<'a> {
    locks: &'a JobLocks,
    job_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex first so our own Arc no longer counts.
        drop(self.guard.take());
        // Clones are only handed out under the shard lock, so a count of one
        // here means no other task holds or awaits this mutex.
        self.locks
            .locks
            .remove_if(&self.job_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
