//! Timer job scheduler.
//!
//! Reconciles persisted jobs with live timers. Jobs due within the chunk
//! window get a timer immediately; later jobs are only persisted and wait
//! for a [`JobLoader`](crate::JobLoader) pass to bring them inside the
//! window. Terminal jobs are deleted in the same step that makes them
//! terminal.
//!
//! All operations on one job id run under a per-id lock, so the
//! read-check-write sequences below never interleave for the same job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::registry::JobLocks;
use crate::{
    ExecutionOutcome, JobDetails, JobEventPublisher, JobExecutionResponse, JobPatch,
    JobRepository, JobStatus, Result, SchedulerConfig, SchedulerControlRegistry, SchedulerError,
    TimerEvent, TimerService, Trigger,
};

/// Delay used to fire an overdue job right away.
pub const MIN_DELAY: std::time::Duration = std::time::Duration::from_millis(1);

/// Outcome of the chunk membership decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arming {
    /// Due inside the chunk: arm a timer with this delay.
    Now(std::time::Duration),
    /// Due beyond the chunk: persist only.
    Deferred,
}

/// The job scheduler.
pub struct TimerJobScheduler {
    config: SchedulerConfig,
    repository: Arc<dyn JobRepository>,
    timer: Arc<dyn TimerService>,
    publisher: Arc<dyn JobEventPublisher>,
    registry: SchedulerControlRegistry,
    locks: JobLocks,
}

impl TimerJobScheduler {
    /// Create a new scheduler. The configuration is validated first.
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn JobRepository>,
        timer: Arc<dyn TimerService>,
        publisher: Arc<dyn JobEventPublisher>,
    ) -> Result<Self> {
        Ok(Self {
            config: config.validate()?,
            repository,
            timer,
            publisher,
            registry: SchedulerControlRegistry::new(),
            locks: JobLocks::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &SchedulerControlRegistry {
        &self.registry
    }

    /// Schedule a job, superseding any active job with the same id.
    ///
    /// A superseded job is released, deleted and published as `CANCELED`
    /// before the new one is published as `SCHEDULED`.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn schedule(&self, job: JobDetails) -> Result<JobDetails> {
        let _guard = self.locks.lock(&job.id).await;
        self.schedule_locked(job, true).await
    }

    async fn schedule_locked(
        &self,
        mut job: JobDetails,
        announce_supersede: bool,
    ) -> Result<JobDetails> {
        // Decide first so a rejected job leaves the stored one untouched.
        let arming = self.plan(&job, self.config.force_execute_expired_jobs)?;

        if let Some(existing) = self.repository.get(&job.id).await? {
            match existing.status {
                JobStatus::Scheduled | JobStatus::Retry => {
                    self.release(&existing.id).await;
                    self.repository.delete(&existing.id).await?;
                    if announce_supersede {
                        let mut canceled = existing.snapshot(JobStatus::Canceled);
                        canceled.scheduled_id = None;
                        self.publisher.publish_status_change(&canceled);
                    }
                    info!(job_id = %existing.id, status = %existing.status, "superseded existing job");
                }
                status => {
                    warn!(job_id = %existing.id, status = %status, "existing job in unexpected state, not scheduling");
                    return Err(SchedulerError::JobService(format!(
                        "job {} already exists with status {}",
                        existing.id, status
                    )));
                }
            }
        }

        job.status = JobStatus::Scheduled;
        let saved = self.arm(job, arming).await?;
        self.publisher.publish_status_change(&saved);
        Ok(saved)
    }

    /// Replace a job's trigger. Returns `None` if the job does not exist.
    ///
    /// The old timer is disarmed before the new one is armed, so the two
    /// triggers never fire concurrently.
    #[tracing::instrument(skip(self, trigger))]
    pub async fn reschedule(&self, job_id: &str, trigger: Trigger) -> Result<Option<JobDetails>> {
        let _guard = self.locks.lock(job_id).await;

        let Some(current) = self.repository.get(job_id).await? else {
            debug!(job_id, "reschedule of unknown job");
            return Ok(None);
        };

        let mut candidate = current.clone();
        candidate.trigger = trigger.clone();
        self.plan(&candidate, self.config.force_execute_expired_jobs)?;

        let Some(merged) = self
            .repository
            .merge(job_id, JobPatch::trigger(trigger))
            .await?
        else {
            return Ok(None);
        };

        self.release(&current.id).await;
        let mut canceled = current.snapshot(JobStatus::Canceled);
        canceled.scheduled_id = None;
        self.publisher.publish_status_change(&canceled);

        // The prior snapshot is already announced above.
        let rescheduled = self.schedule_locked(merged, false).await?;
        info!(job_id, due = ?rescheduled.due_time(), "job rescheduled");
        Ok(Some(rescheduled))
    }

    /// Cancel a job. Returns `None` if there is nothing to cancel.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<Option<JobDetails>> {
        let _guard = self.locks.lock(job_id).await;

        let Some(job) = self.repository.get(job_id).await? else {
            return Ok(None);
        };

        self.release(job_id).await;
        self.repository.delete(job_id).await?;

        let mut canceled = job.snapshot(JobStatus::Canceled);
        canceled.scheduled_id = None;
        self.publisher.publish_status_change(&canceled);
        info!(job_id, "job canceled");
        Ok(Some(canceled))
    }

    /// Route an executor response to the success or error handler.
    pub async fn handle_execution_response(
        &self,
        response: JobExecutionResponse,
    ) -> Result<JobDetails> {
        match response.outcome {
            ExecutionOutcome::Success => self.handle_job_execution_success(response).await,
            ExecutionOutcome::Error { .. } => self.handle_job_execution_error(response).await,
        }
    }

    /// A firing completed. Arms the next occurrence or retires the job.
    #[tracing::instrument(skip(self, response), fields(job_id = %response.job_id))]
    pub async fn handle_job_execution_success(
        &self,
        response: JobExecutionResponse,
    ) -> Result<JobDetails> {
        let _guard = self.locks.lock(&response.job_id).await;
        let result = self.complete_success(&response.job_id).await;
        self.release_on_error(&response.job_id, &result).await;
        result
    }

    async fn complete_success(&self, job_id: &str) -> Result<JobDetails> {
        let job = self.require(job_id).await?;

        self.release(&job.id).await;

        let mut next = job;
        next.trigger.advance();
        next.execution_counter += 1;

        if next.due_time().is_some() {
            next.status = JobStatus::Scheduled;
            next.retries = 0;
            // Recurring occurrences that slipped into the past still run.
            let arming = self.plan(&next, true)?;
            let saved = self.arm(next, arming).await?;
            self.publisher
                .publish_status_change(&saved.snapshot(JobStatus::Executed));
            debug!(job_id = %saved.id, due = ?saved.due_time(), executions = saved.execution_counter, "armed next occurrence");
            Ok(saved)
        } else {
            self.repository.delete(&next.id).await?;
            let mut executed = next.snapshot(JobStatus::Executed);
            executed.scheduled_id = None;
            self.publisher.publish_status_change(&executed);
            info!(job_id = %executed.id, executions = executed.execution_counter, "job executed");
            Ok(executed)
        }
    }

    /// A firing failed. Retries after the backoff or gives up once the
    /// retry budget is spent.
    #[tracing::instrument(skip(self, response), fields(job_id = %response.job_id))]
    pub async fn handle_job_execution_error(
        &self,
        response: JobExecutionResponse,
    ) -> Result<JobDetails> {
        let _guard = self.locks.lock(&response.job_id).await;
        let result = self.complete_error(&response).await;
        self.release_on_error(&response.job_id, &result).await;
        result
    }

    async fn complete_error(&self, response: &JobExecutionResponse) -> Result<JobDetails> {
        let job = self.require(&response.job_id).await?;

        if let ExecutionOutcome::Error { message } = &response.outcome {
            warn!(job_id = %job.id, retries = job.retries, error = %message, "job execution failed");
        }

        if self.is_expired(&job, Utc::now()) {
            return self.expire(job).await;
        }

        self.release(&job.id).await;

        let mut retry = job;
        retry.retries += 1;
        retry.status = JobStatus::Retry;
        let delay = std::time::Duration::from_millis(self.config.backoff_retry_millis);
        let saved = self.arm(retry, Arming::Now(delay)).await?;
        self.publisher.publish_status_change(&saved);
        info!(job_id = %saved.id, retries = saved.retries, delay_ms = self.config.backoff_retry_millis, "job scheduled for retry");
        Ok(saved)
    }

    /// Arm a persisted job this process does not track yet.
    ///
    /// Used by the loader. Returns `None` when the job already holds a live
    /// timer here. With `on_service_start`, a job that went overdue while
    /// the process was down is retired as `ERROR` unless
    /// `force_execute_expired_jobs_on_service_start` is set.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn internal_schedule(
        &self,
        mut job: JobDetails,
        on_service_start: bool,
    ) -> Result<Option<JobDetails>> {
        let _guard = self.locks.lock(&job.id).await;

        if self.registry.contains(&job.id) {
            debug!(job_id = %job.id, "job already armed in this process");
            return Ok(None);
        }

        let due = job
            .due_time()
            .ok_or_else(|| SchedulerError::InvalidTrigger(job.id.clone()))?;

        let overdue = due < Utc::now();
        if overdue && on_service_start && !self.config.force_execute_expired_jobs_on_service_start
        {
            info!(job_id = %job.id, due = %due, "job expired while the service was down");
            return self.expire(job).await.map(Some);
        }

        let force = if on_service_start {
            self.config.force_execute_expired_jobs_on_service_start
        } else {
            self.config.force_execute_expired_jobs
        };
        let arming = self.plan(&job, force)?;

        // A handle persisted by a previous process means nothing here.
        job.scheduled_id = None;
        let saved = self.arm(job, arming).await?;
        self.publisher.publish_status_change(&saved);
        Ok(Some(saved))
    }

    /// When the job's live timer was registered, if it holds one.
    pub fn scheduled(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.registry.get(job_id).map(|r| r.registered_at)
    }

    /// Resolve a timer wakeup to the job it belongs to.
    ///
    /// Returns `None` for wakeups that no longer match the registry, e.g. a
    /// timer that elapsed while the job was being canceled. The registry
    /// entry stays until the execution outcome is handled, which keeps the
    /// loader from arming the job a second time meanwhile.
    pub async fn on_timer_fired(&self, event: &TimerEvent) -> Result<Option<JobDetails>> {
        let _guard = self.locks.lock(&event.job_id).await;

        match self.registry.get(&event.job_id) {
            Some(record) if record.handle == event.handle => {}
            _ => {
                debug!(job_id = %event.job_id, handle = %event.handle, "ignoring stale timer");
                return Ok(None);
            }
        }

        let job = match self.repository.get(&event.job_id).await {
            Ok(job) => job,
            Err(e) => {
                // Leave the job to the next loader pass.
                self.registry.remove_if_handle(&event.job_id, &event.handle);
                return Err(e.into());
            }
        };
        if job.is_none() {
            self.registry.remove_if_handle(&event.job_id, &event.handle);
            warn!(job_id = %event.job_id, "timer fired for a job that is no longer stored");
        }
        Ok(job)
    }

    /// Disarm every live timer and clear the registry.
    pub async fn shutdown(&self) {
        let records = self.registry.drain();
        let count = records.len();
        for record in records {
            self.timer.cancel(&record.handle).await;
        }
        info!(count, "scheduler shut down, timers disarmed");
    }

    /// Chunk membership decision for the job's next due time.
    fn plan(&self, job: &JobDetails, force_overdue: bool) -> Result<Arming> {
        let due = job
            .due_time()
            .ok_or_else(|| SchedulerError::InvalidTrigger(job.id.clone()))?;
        let now = Utc::now();

        if due >= now + self.config.chunk_window() {
            return Ok(Arming::Deferred);
        }

        let delay = due - now;
        if delay < Duration::zero() {
            if !force_overdue {
                return Err(SchedulerError::InvalidScheduleTime {
                    job_id: job.id.clone(),
                    due,
                });
            }
            debug!(job_id = %job.id, overdue_ms = -delay.num_milliseconds(), "forcing overdue job");
            return Ok(Arming::Now(MIN_DELAY));
        }

        Ok(Arming::Now(delay.to_std().unwrap_or(MIN_DELAY)))
    }

    /// Register the timer (if due inside the chunk) and persist the job.
    ///
    /// A failed write disarms the timer again so no orphan stays live.
    async fn arm(&self, mut job: JobDetails, arming: Arming) -> Result<JobDetails> {
        job.scheduled_id = None;

        if let Arming::Now(delay) = arming {
            let handle = self.timer.schedule(&job.id, delay).await?;
            self.registry.insert(&job.id, handle.clone());
            job.scheduled_id = Some(handle.to_string());
            debug!(job_id = %job.id, handle = %handle, delay_ms = delay.as_millis() as u64, "job armed");
        } else {
            debug!(job_id = %job.id, due = ?job.due_time(), "job deferred beyond chunk");
        }

        match self.repository.save(&job).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                self.release(&job.id).await;
                Err(e.into())
            }
        }
    }

    /// Best-effort disarm of the timer this process holds for the job.
    ///
    /// Only the registry's handle is canceled. A persisted `scheduled_id`
    /// may come from an earlier process, where the same handle id can now
    /// name another job's timer.
    async fn release(&self, job_id: &str) {
        if let Some(record) = self.registry.remove(job_id) {
            if !self.timer.cancel(&record.handle).await {
                debug!(job_id, handle = %record.handle, "timer already fired or unknown");
            }
        }
    }

    /// After a failed outcome the fired timer is gone; drop its entry so
    /// a loader pass can arm the job again.
    async fn release_on_error(&self, job_id: &str, result: &Result<JobDetails>) {
        if let Err(e) = result {
            warn!(job_id, error = %e, "failed to handle execution outcome, releasing registration");
            self.release(job_id).await;
        }
    }

    /// Whether the job has outrun its retry budget.
    ///
    /// The budget shrinks by one backoff per retry; the job expires once
    /// it is overdue by more than what is left.
    fn is_expired(&self, job: &JobDetails, now: DateTime<Utc>) -> bool {
        let Some(due) = job.due_time() else {
            return true;
        };
        let delay = (due - now).num_milliseconds();
        delay.saturating_add(self.config.remaining_retry_budget_millis(job.retries)) < 0
    }

    /// Retire a job as `ERROR`.
    async fn expire(&self, job: JobDetails) -> Result<JobDetails> {
        self.release(&job.id).await;
        self.repository.delete(&job.id).await?;

        let mut failed = job.snapshot(JobStatus::Error);
        failed.scheduled_id = None;
        self.publisher.publish_status_change(&failed);
        warn!(job_id = %failed.id, retries = failed.retries, "job retry budget exhausted");
        Ok(failed)
    }

    async fn require(&self, job_id: &str) -> Result<JobDetails> {
        self.repository
            .get(job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobService(format!("job {job_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualTimer, RecordingPublisher};
    use crate::{InMemoryJobRepository, RepositoryError, TimerHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        scheduler: TimerJobScheduler,
        repository: Arc<InMemoryJobRepository>,
        timer: Arc<ManualTimer>,
        publisher: Arc<RecordingPublisher>,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let repository = Arc::new(InMemoryJobRepository::new());
        let timer = Arc::new(ManualTimer::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let scheduler = TimerJobScheduler::new(
            config,
            repository.clone(),
            timer.clone(),
            publisher.clone(),
        )
        .unwrap();
        Harness {
            scheduler,
            repository,
            timer,
            publisher,
        }
    }

    fn due_in(id: &str, delta: Duration) -> JobDetails {
        JobDetails::new(id, Trigger::at(Utc::now() + delta))
    }

    #[test]
    fn test_plan_boundaries() {
        let h = harness(SchedulerConfig::default());

        let inside = due_in("a", Duration::minutes(9));
        assert!(matches!(h.scheduler.plan(&inside, false), Ok(Arming::Now(_))));

        let outside = due_in("b", Duration::minutes(11));
        assert_eq!(h.scheduler.plan(&outside, false).unwrap(), Arming::Deferred);

        let overdue = due_in("c", -Duration::minutes(1));
        assert!(matches!(
            h.scheduler.plan(&overdue, false),
            Err(SchedulerError::InvalidScheduleTime { .. })
        ));
        assert_eq!(
            h.scheduler.plan(&overdue, true).unwrap(),
            Arming::Now(MIN_DELAY)
        );

        let mut exhausted = due_in("d", Duration::minutes(1));
        exhausted.trigger.advance();
        assert!(matches!(
            h.scheduler.plan(&exhausted, true),
            Err(SchedulerError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn test_is_expired_uses_shrinking_budget() {
        let h = harness(SchedulerConfig {
            backoff_retry_millis: 1000,
            max_interval_limit_to_retry_millis: 5000,
            ..Default::default()
        });
        let now = Utc::now();
        let mut job = JobDetails::new("a", Trigger::at(now - Duration::milliseconds(2500)));

        job.retries = 2; // 3000ms left, 2500ms overdue
        assert!(!h.scheduler.is_expired(&job, now));

        job.retries = 3; // 2000ms left
        assert!(h.scheduler.is_expired(&job, now));
    }

    #[tokio::test]
    async fn test_schedule_arms_timer_inside_chunk() {
        let h = harness(SchedulerConfig::default());

        let job = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(2)))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.scheduled_id.is_some());
        assert!(h.scheduler.scheduled("a").is_some());
        assert_eq!(h.timer.armed_count(), 1);
        assert_eq!(h.publisher.statuses_for("a"), vec![JobStatus::Scheduled]);
    }

    #[tokio::test]
    async fn test_schedule_defers_beyond_chunk() {
        let h = harness(SchedulerConfig::default());

        let job = h
            .scheduler
            .schedule(due_in("a", Duration::hours(1)))
            .await
            .unwrap();

        assert!(job.scheduled_id.is_none());
        assert!(h.scheduler.scheduled("a").is_none());
        assert_eq!(h.timer.armed_count(), 0);
        assert!(h.repository.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_schedule_supersedes_active_job() {
        let h = harness(SchedulerConfig::default());

        let first = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(30)))
            .await
            .unwrap();
        let second = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(60)))
            .await
            .unwrap();

        assert_ne!(first.scheduled_id, second.scheduled_id);
        assert_eq!(h.timer.armed_count(), 1, "old timer released");
        assert_eq!(h.repository.len().await, 1);
        assert_eq!(
            h.publisher.statuses_for("a"),
            vec![JobStatus::Scheduled, JobStatus::Canceled, JobStatus::Scheduled]
        );
    }

    #[tokio::test]
    async fn test_rejected_schedule_keeps_existing_job() {
        let h = harness(SchedulerConfig {
            force_execute_expired_jobs: false,
            ..Default::default()
        });

        h.scheduler
            .schedule(due_in("a", Duration::seconds(30)))
            .await
            .unwrap();
        let result = h
            .scheduler
            .schedule(due_in("a", -Duration::minutes(10)))
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::InvalidScheduleTime { .. })
        ));
        assert!(h.repository.exists("a").await.unwrap());
        assert_eq!(h.timer.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_schedule_aborts_on_unexpected_existing_status() {
        let h = harness(SchedulerConfig::default());
        let mut stuck = due_in("a", Duration::seconds(30));
        stuck.status = JobStatus::Executed;
        h.repository.save(&stuck).await.unwrap();

        let result = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(30)))
            .await;

        assert!(matches!(result, Err(SchedulerError::JobService(_))));
        assert_eq!(h.timer.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_failure_persists_nothing() {
        let h = harness(SchedulerConfig::default());
        h.timer.fail_for("a");

        let result = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(1)))
            .await;

        assert!(matches!(result, Err(SchedulerError::Timer(_))));
        assert!(h.scheduler.registry().is_empty());
        assert!(!h.repository.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_timer_event_ignored() {
        let h = harness(SchedulerConfig::default());
        h.scheduler
            .schedule(due_in("a", Duration::seconds(1)))
            .await
            .unwrap();

        let stale = TimerEvent {
            job_id: "a".to_string(),
            handle: TimerHandle::new("not-the-live-one"),
        };
        assert!(h.scheduler.on_timer_fired(&stale).await.unwrap().is_none());

        let live = h.timer.fire("a").unwrap();
        let job = h.scheduler.on_timer_fired(&live).await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert!(
            h.scheduler.scheduled("a").is_some(),
            "entry kept until the outcome is handled"
        );
    }

    #[tokio::test]
    async fn test_internal_schedule_skips_tracked_job() {
        let h = harness(SchedulerConfig::default());
        let job = h
            .scheduler
            .schedule(due_in("a", Duration::seconds(5)))
            .await
            .unwrap();

        let result = h.scheduler.internal_schedule(job, false).await.unwrap();
        assert!(result.is_none());
        assert_eq!(h.timer.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_internal_schedule_expires_overdue_on_start() {
        let h = harness(SchedulerConfig::default());
        let job = due_in("a", -Duration::minutes(5));
        h.repository.save(&job).await.unwrap();

        let result = h
            .scheduler
            .internal_schedule(job, true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.status, JobStatus::Error);
        assert!(!h.repository.exists("a").await.unwrap());
        assert_eq!(h.publisher.statuses_for("a"), vec![JobStatus::Error]);
    }

    #[tokio::test]
    async fn test_internal_schedule_forces_overdue_on_start_when_enabled() {
        let h = harness(SchedulerConfig {
            force_execute_expired_jobs_on_service_start: true,
            ..Default::default()
        });
        let mut job = due_in("a", -Duration::minutes(5));
        job.scheduled_id = Some("timer-from-previous-run".to_string());
        h.repository.save(&job).await.unwrap();

        let armed = h
            .scheduler
            .internal_schedule(job, true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(armed.status, JobStatus::Scheduled);
        assert_ne!(armed.scheduled_id.as_deref(), Some("timer-from-previous-run"));
        assert_eq!(h.timer.last_delay("a"), Some(MIN_DELAY));
    }

    #[tokio::test]
    async fn test_shutdown_disarms_everything() {
        let h = harness(SchedulerConfig::default());
        for id in ["a", "b", "c"] {
            h.scheduler
                .schedule(due_in(id, Duration::seconds(5)))
                .await
                .unwrap();
        }
        assert_eq!(h.timer.armed_count(), 3);

        h.scheduler.shutdown().await;

        assert_eq!(h.timer.armed_count(), 0);
        assert!(h.scheduler.registry().is_empty());
        assert_eq!(h.repository.len().await, 3, "jobs stay persisted");
    }

    /// In-memory repository whose reads can be switched off.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryJobRepository,
        fail_reads: AtomicBool,
    }

    impl FlakyRepository {
        fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        fn check(&self) -> std::result::Result<(), RepositoryError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl JobRepository for FlakyRepository {
        async fn exists(&self, id: &str) -> std::result::Result<bool, RepositoryError> {
            self.check()?;
            self.inner.exists(id).await
        }

        async fn get(&self, id: &str) -> std::result::Result<Option<JobDetails>, RepositoryError> {
            self.check()?;
            self.inner.get(id).await
        }

        async fn save(&self, job: &JobDetails) -> std::result::Result<JobDetails, RepositoryError> {
            self.inner.save(job).await
        }

        async fn merge(
            &self,
            id: &str,
            patch: JobPatch,
        ) -> std::result::Result<Option<JobDetails>, RepositoryError> {
            self.inner.merge(id, patch).await
        }

        async fn delete(&self, id: &str) -> std::result::Result<Option<JobDetails>, RepositoryError> {
            self.inner.delete(id).await
        }

        async fn find_due_between(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            statuses: &[JobStatus],
        ) -> std::result::Result<Vec<JobDetails>, RepositoryError> {
            self.check()?;
            self.inner.find_due_between(from, to, statuses).await
        }
    }

    fn flaky_harness() -> (TimerJobScheduler, Arc<FlakyRepository>, Arc<ManualTimer>) {
        let repository = Arc::new(FlakyRepository::default());
        let timer = Arc::new(ManualTimer::new());
        let scheduler = TimerJobScheduler::new(
            SchedulerConfig::default(),
            repository.clone(),
            timer.clone(),
            Arc::new(RecordingPublisher::new()),
        )
        .unwrap();
        (scheduler, repository, timer)
    }

    #[tokio::test]
    async fn test_cancel_leaves_other_jobs_timer_alone() {
        let h = harness(SchedulerConfig::default());
        let live = h
            .scheduler
            .schedule(due_in("b", Duration::seconds(30)))
            .await
            .unwrap();

        // Handle ids restart with the process, so a row written by an
        // earlier run can carry an id that now belongs to "b".
        let mut stale = due_in("a", Duration::hours(3));
        stale.scheduled_id = live.scheduled_id.clone();
        h.repository.save(&stale).await.unwrap();

        h.scheduler.cancel("a").await.unwrap();
        h.scheduler
            .schedule(due_in("a", Duration::hours(4)))
            .await
            .unwrap();

        assert_eq!(h.timer.armed_for("b").len(), 1);
        assert!(h.timer.canceled().is_empty());
        assert_eq!(
            h.scheduler.registry().get("b").map(|r| r.handle.to_string()),
            live.scheduled_id
        );
    }

    #[tokio::test]
    async fn test_reschedule_leaves_other_jobs_timer_alone() {
        let h = harness(SchedulerConfig::default());
        let live = h
            .scheduler
            .schedule(due_in("b", Duration::seconds(30)))
            .await
            .unwrap();
        let mut stale = due_in("a", Duration::hours(3));
        stale.scheduled_id = live.scheduled_id.clone();
        h.repository.save(&stale).await.unwrap();

        h.scheduler
            .reschedule("a", Trigger::at(Utc::now() + Duration::hours(5)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.timer.armed_for("b").len(), 1);
        assert!(h.timer.canceled().is_empty());
    }

    #[tokio::test]
    async fn test_failed_outcome_lookup_releases_registration() {
        let (scheduler, repository, timer) = flaky_harness();
        scheduler
            .schedule(due_in("a", Duration::seconds(1)))
            .await
            .unwrap();
        let event = timer.fire("a").unwrap();
        let job = scheduler.on_timer_fired(&event).await.unwrap().unwrap();

        repository.fail_reads(true);
        let success = scheduler
            .handle_job_execution_success(JobExecutionResponse::success(&job.id))
            .await;
        assert!(matches!(success, Err(SchedulerError::Repository(_))));
        assert!(scheduler.scheduled("a").is_none(), "no entry without a timer");

        repository.fail_reads(false);
        let stored = repository.get("a").await.unwrap().unwrap();
        let rearmed = scheduler.internal_schedule(stored, false).await.unwrap();
        assert!(rearmed.is_some());
        assert_eq!(timer.armed_for("a").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_error_outcome_releases_registration() {
        let (scheduler, repository, timer) = flaky_harness();
        scheduler
            .schedule(due_in("a", Duration::seconds(1)))
            .await
            .unwrap();
        let event = timer.fire("a").unwrap();
        scheduler.on_timer_fired(&event).await.unwrap().unwrap();

        repository.fail_reads(true);
        let error = scheduler
            .handle_job_execution_error(JobExecutionResponse::error("a", "boom"))
            .await;

        assert!(error.is_err());
        assert!(scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_wakeup_lookup_releases_registration() {
        let (scheduler, repository, timer) = flaky_harness();
        scheduler
            .schedule(due_in("a", Duration::seconds(1)))
            .await
            .unwrap();
        let event = timer.fire("a").unwrap();

        repository.fail_reads(true);
        assert!(scheduler.on_timer_fired(&event).await.is_err());
        assert!(scheduler.scheduled("a").is_none());
        assert_eq!(timer.armed_count(), 0);
    }
}
