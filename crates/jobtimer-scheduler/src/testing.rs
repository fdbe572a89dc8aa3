//! Test doubles for the scheduler's collaborators.
//!
//! - [`ManualTimer`]: a [`TimerService`] that only fires when told to
//! - [`RecordingPublisher`]: a [`JobEventPublisher`] that keeps every event

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    JobDetails, JobEventPublisher, JobStatus, SchedulerError, TimerEvent, TimerHandle,
    TimerService,
};

/// A timer whose wakeups are fired by hand.
///
/// # Example
///
/// ```
/// use jobtimer_scheduler::TimerService;
/// use jobtimer_scheduler::testing::ManualTimer;
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let timer = ManualTimer::new();
///     let handle = timer
///         .schedule("job-1", std::time::Duration::from_secs(5))
///         .await
///         .unwrap();
///     let event = timer.fire("job-1").unwrap();
///     assert_eq!(event.handle, handle);
/// });
/// ```
#[derive(Debug, Default)]
pub struct ManualTimer {
    next_id: AtomicU64,
    armed: Mutex<HashMap<TimerHandle, String>>,
    delays: Mutex<HashMap<String, Vec<Duration>>>,
    canceled: Mutex<Vec<TimerHandle>>,
    failing: Mutex<HashSet<String>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every registration for `job_id` from now on.
    pub fn fail_for(&self, job_id: &str) {
        self.failing
            .lock()
            .expect("lock poisoned")
            .insert(job_id.to_string());
    }

    /// Accept registrations for `job_id` again.
    pub fn recover(&self, job_id: &str) {
        self.failing.lock().expect("lock poisoned").remove(job_id);
    }

    /// Number of armed wakeups across all jobs.
    pub fn armed_count(&self) -> usize {
        self.armed.lock().expect("lock poisoned").len()
    }

    /// Handles currently armed for `job_id`.
    pub fn armed_for(&self, job_id: &str) -> Vec<TimerHandle> {
        self.armed
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, armed_job)| armed_job.as_str() == job_id)
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Delay of the most recent registration for `job_id`.
    pub fn last_delay(&self, job_id: &str) -> Option<Duration> {
        self.delays
            .lock()
            .expect("lock poisoned")
            .get(job_id)
            .and_then(|d| d.last().copied())
    }

    /// Every registration ever made for `job_id`.
    pub fn registrations(&self, job_id: &str) -> usize {
        self.delays
            .lock()
            .expect("lock poisoned")
            .get(job_id)
            .map_or(0, Vec::len)
    }

    /// Handles disarmed through [`TimerService::cancel`].
    pub fn canceled(&self) -> Vec<TimerHandle> {
        self.canceled.lock().expect("lock poisoned").clone()
    }

    /// Elapse the armed wakeup for `job_id`, as the real timer would.
    pub fn fire(&self, job_id: &str) -> Option<TimerEvent> {
        let mut armed = self.armed.lock().expect("lock poisoned");
        let handle = armed
            .iter()
            .find(|(_, armed_job)| armed_job.as_str() == job_id)
            .map(|(handle, _)| handle.clone())?;
        armed.remove(&handle);
        Some(TimerEvent {
            job_id: job_id.to_string(),
            handle,
        })
    }
}

#[async_trait]
impl TimerService for ManualTimer {
    async fn schedule(&self, job_id: &str, delay: Duration) -> Result<TimerHandle, SchedulerError> {
        if self.failing.lock().expect("lock poisoned").contains(job_id) {
            return Err(SchedulerError::Timer(format!(
                "refusing registration for {job_id}"
            )));
        }

        let handle = TimerHandle::new(format!(
            "manual-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        self.armed
            .lock()
            .expect("lock poisoned")
            .insert(handle.clone(), job_id.to_string());
        self.delays
            .lock()
            .expect("lock poisoned")
            .entry(job_id.to_string())
            .or_default()
            .push(delay);
        Ok(handle)
    }

    async fn cancel(&self, handle: &TimerHandle) -> bool {
        let removed = self.armed.lock().expect("lock poisoned").remove(handle);
        if removed.is_some() {
            self.canceled
                .lock()
                .expect("lock poisoned")
                .push(handle.clone());
        }
        removed.is_some()
    }
}

/// Keeps every published status change.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<JobDetails>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobDetails> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// Published statuses for `job_id`, oldest first.
    pub fn statuses_for(&self, job_id: &str) -> Vec<JobStatus> {
        self.events
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|e| e.id == job_id)
            .map(|e| e.status)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }
}

impl JobEventPublisher for RecordingPublisher {
    fn publish_status_change(&self, job: &JobDetails) {
        self.events
            .lock()
            .expect("lock poisoned")
            .push(job.clone());
    }
}
