//! Scheduler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::SchedulerError;

/// Upper bound for the minute-based windows: one hundred years.
pub const MAX_WINDOW_MINUTES: u64 = 100 * 365 * 24 * 60;

/// Tunables for retry policy, chunked loading and overdue handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Delay before a failed job is retried.
    pub backoff_retry_millis: u64,
    /// Total time budget a failing job may keep retrying.
    pub max_interval_limit_to_retry_millis: u64,
    /// Forward window within which due jobs hold a live timer.
    pub scheduler_chunk_in_minutes: u64,
    /// Period between backlog loader passes.
    pub load_job_interval_in_minutes: u64,
    /// How far back the loader looks for overdue jobs. Zero means no lower bound.
    pub load_job_from_current_time_interval_in_minutes: u64,
    /// Fire overdue jobs immediately instead of rejecting them.
    pub force_execute_expired_jobs: bool,
    /// Fire jobs that went overdue while the process was down.
    pub force_execute_expired_jobs_on_service_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_retry_millis: 1000,
            max_interval_limit_to_retry_millis: 60_000,
            scheduler_chunk_in_minutes: 10,
            load_job_interval_in_minutes: 10,
            load_job_from_current_time_interval_in_minutes: 0,
            force_execute_expired_jobs: true,
            force_execute_expired_jobs_on_service_start: false,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration, clamping the load interval to the chunk size.
    ///
    /// A load interval longer than the chunk would let jobs fall due between
    /// two passes without ever being armed.
    pub fn validate(mut self) -> Result<Self, SchedulerError> {
        if self.scheduler_chunk_in_minutes == 0 {
            return Err(SchedulerError::InvalidConfig(
                "schedulerChunkInMinutes must be greater than zero".to_string(),
            ));
        }
        if self.backoff_retry_millis == 0 {
            return Err(SchedulerError::InvalidConfig(
                "backoffRetryMillis must be greater than zero".to_string(),
            ));
        }
        if self.load_job_interval_in_minutes == 0 {
            return Err(SchedulerError::InvalidConfig(
                "loadJobIntervalInMinutes must be greater than zero".to_string(),
            ));
        }
        for (key, minutes) in [
            ("schedulerChunkInMinutes", self.scheduler_chunk_in_minutes),
            (
                "loadJobFromCurrentTimeIntervalInMinutes",
                self.load_job_from_current_time_interval_in_minutes,
            ),
        ] {
            if minutes > MAX_WINDOW_MINUTES {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{key} must be at most {MAX_WINDOW_MINUTES}, got {minutes}"
                )));
            }
        }
        for (key, millis) in [
            ("backoffRetryMillis", self.backoff_retry_millis),
            (
                "maxIntervalLimitToRetryMillis",
                self.max_interval_limit_to_retry_millis,
            ),
        ] {
            if i64::try_from(millis).is_err() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{key} must be at most {}, got {millis}",
                    i64::MAX
                )));
            }
        }
        if self.load_job_interval_in_minutes > self.scheduler_chunk_in_minutes {
            warn!(
                load_interval = self.load_job_interval_in_minutes,
                chunk = self.scheduler_chunk_in_minutes,
                "load interval exceeds chunk size, clamping"
            );
            self.load_job_interval_in_minutes = self.scheduler_chunk_in_minutes;
        }
        Ok(self)
    }

    pub fn chunk_window(&self) -> Duration {
        Duration::minutes(self.scheduler_chunk_in_minutes as i64)
    }

    pub fn load_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.load_job_interval_in_minutes * 60)
    }

    /// Loader lookback, or `None` when overdue jobs are loaded regardless of age.
    pub fn lookback(&self) -> Option<Duration> {
        match self.load_job_from_current_time_interval_in_minutes {
            0 => None,
            minutes => Some(Duration::minutes(minutes as i64)),
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::milliseconds(self.backoff_retry_millis as i64)
    }

    /// Retry budget left after `retries` failed attempts, in milliseconds.
    ///
    /// Shrinks linearly by one backoff per retry and goes negative once the
    /// retries outgrow the configured limit.
    pub fn remaining_retry_budget_millis(&self, retries: u32) -> i64 {
        let limit = i64::try_from(self.max_interval_limit_to_retry_millis).unwrap_or(i64::MAX);
        let backoff = i64::try_from(self.backoff_retry_millis).unwrap_or(i64::MAX);
        limit.saturating_sub(i64::from(retries).saturating_mul(backoff))
    }
}
