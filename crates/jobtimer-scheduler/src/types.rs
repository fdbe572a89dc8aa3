//! Scheduler types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Trigger;

/// Lifecycle state of a job.
///
/// `Executed`, `Canceled` and `Error` are terminal: a job reaching one of
/// them is deleted from the repository in the same step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for its next due time.
    #[default]
    Scheduled,
    /// Last execution failed, waiting for the backoff to elapse.
    Retry,
    /// Fired and its trigger is exhausted.
    Executed,
    /// Canceled or superseded by a reschedule.
    Canceled,
    /// Retry budget exhausted.
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Executed | JobStatus::Canceled | JobStatus::Error
        )
    }

    /// States a job may be in while it still has work ahead of it.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Scheduled, JobStatus::Retry];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Retry => "RETRY",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RETRY" => Ok(JobStatus::Retry),
            "EXECUTED" => Ok(JobStatus::Executed),
            "CANCELED" => Ok(JobStatus::Canceled),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    /// Caller-supplied unique id.
    pub id: String,
    /// When the job fires.
    pub trigger: Trigger,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: JobStatus,
    /// Failed attempts since the last successful firing.
    #[serde(default)]
    pub retries: u32,
    /// Successful firings so far.
    #[serde(default)]
    pub execution_counter: u32,
    /// Timer handle while armed in some process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_id: Option<String>,
    /// Loader ordering hint, higher loads first.
    #[serde(default)]
    pub priority: i32,
    /// Correlation data carried through to the executor untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<serde_json::Value>,
    /// When this record was last written.
    #[serde(default = "Utc::now")]
    pub last_update: DateTime<Utc>,
}

impl JobDetails {
    /// Create a new job in `SCHEDULED` state.
    pub fn new(id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            id: id.into(),
            trigger,
            status: JobStatus::Scheduled,
            retries: 0,
            execution_counter: 0,
            scheduled_id: None,
            priority: 0,
            correlation: None,
            last_update: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation: serde_json::Value) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// The trigger's next due time.
    pub fn due_time(&self) -> Option<DateTime<Utc>> {
        self.trigger.has_next_due_time()
    }

    /// Copy of this job in `status`, as published for a transition.
    pub fn snapshot(&self, status: JobStatus) -> Self {
        let mut snapshot = self.clone();
        snapshot.status = status;
        snapshot.last_update = Utc::now();
        snapshot
    }
}

/// Partial update merged into a stored job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub trigger: Option<Trigger>,
    pub status: Option<JobStatus>,
    pub priority: Option<i32>,
    pub correlation: Option<serde_json::Value>,
}

impl JobPatch {
    pub fn trigger(trigger: Trigger) -> Self {
        Self {
            trigger: Some(trigger),
            ..Default::default()
        }
    }

    /// Apply the set fields to `job`.
    pub fn apply(self, job: &mut JobDetails) {
        if let Some(trigger) = self.trigger {
            job.trigger = trigger;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(correlation) = self.correlation {
            job.correlation = Some(correlation);
        }
        job.last_update = Utc::now();
    }
}

/// Outcome reported by the executor for one firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Error { message: String },
}

/// What the executor hands back after running a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecutionResponse {
    pub job_id: String,
    pub outcome: ExecutionOutcome,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl JobExecutionResponse {
    pub fn success(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: ExecutionOutcome::Success,
            timestamp: Utc::now(),
        }
    }

    pub fn error(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: ExecutionOutcome::Error {
                message: message.into(),
            },
            timestamp: Utc::now(),
        }
    }
}
