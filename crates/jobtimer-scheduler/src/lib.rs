//! Durable timer-based job scheduler.
//!
//! This crate reconciles an unbounded, persisted backlog of jobs with a
//! bounded set of live timers:
//! - Jobs due within the scheduling chunk hold a live timer
//! - Later jobs stay in the repository until a loader pass reaches them
//! - Failed executions retry with a fixed backoff inside a shrinking budget
//! - Terminal jobs are deleted, never archived
//!
//! Persistence, the timer primitive, status publishing and job execution are
//! collaborators behind [`JobRepository`], [`TimerService`],
//! [`JobEventPublisher`] and [`JobExecutor`].

mod config;
mod dispatch;
mod error;
mod loader;
mod publisher;
mod registry;
mod repository;
mod scheduler;
pub mod testing;
mod timer;
mod trigger;
mod types;

pub use config::{MAX_WINDOW_MINUTES, SchedulerConfig};
pub use dispatch::{ExecutionFuture, JobDispatcher, JobExecutor, job_executor};
pub use error::{RepositoryError, Result, SchedulerError};
pub use loader::{JobLoader, LoadReport};
pub use publisher::{BroadcastPublisher, JobEventPublisher, TracingPublisher};
pub use registry::{SchedulerControlRecord, SchedulerControlRegistry};
pub use repository::{InMemoryJobRepository, JobRepository};
pub use scheduler::{MIN_DELAY, TimerJobScheduler};
pub use timer::{TimerEvent, TimerHandle, TimerService, TokioTimerService};
pub use trigger::Trigger;
pub use types::{ExecutionOutcome, JobDetails, JobExecutionResponse, JobPatch, JobStatus};
