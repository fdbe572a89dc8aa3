//! Job persistence.
//!
//! The repository is the single source of truth for which jobs must
//! eventually run. Concrete backends live outside this crate; the
//! in-memory implementation here backs tests and the daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{JobDetails, JobPatch, JobStatus, RepositoryError};

/// Storage for [`JobDetails`].
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError>;

    /// Insert or replace.
    async fn save(&self, job: &JobDetails) -> Result<JobDetails, RepositoryError>;

    /// Merge `patch` into the stored job, returning the merged job.
    async fn merge(&self, id: &str, patch: JobPatch) -> Result<Option<JobDetails>, RepositoryError>;

    /// Delete, returning the removed job.
    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError>;

    /// Jobs in `statuses` due within `[from, to]`, highest priority first,
    /// then earliest due time.
    async fn find_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError>;
}

/// [`JobRepository`] held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, JobDetails>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository holding `jobs` as-is.
    pub fn with_jobs(jobs: impl IntoIterator<Item = JobDetails>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|j| (j.id.clone(), j)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<JobDetails> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.jobs.read().await.contains_key(id))
    }

    async fn get(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save(&self, job: &JobDetails) -> Result<JobDetails, RepositoryError> {
        let mut job = job.clone();
        job.last_update = Utc::now();
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn merge(&self, id: &str, patch: JobPatch) -> Result<Option<JobDetails>, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.get_mut(id).map(|job| {
            patch.apply(job);
            job.clone()
        }))
    }

    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, RepositoryError> {
        Ok(self.jobs.write().await.remove(id))
    }

    async fn find_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDetails>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<(DateTime<Utc>, JobDetails)> = jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .filter_map(|j| j.due_time().map(|due| (due, j)))
            .filter(|(due, _)| *due >= from && *due <= to)
            .map(|(due, j)| (due, j.clone()))
            .collect();

        due.sort_by(|(a_due, a), (b_due, b)| b.priority.cmp(&a.priority).then(a_due.cmp(b_due)));

        Ok(due.into_iter().map(|(_, j)| j).collect())
    }
}
