//! Timer wakeup dispatch.
//!
//! Turns elapsed timers into executor calls and feeds the executor's
//! verdict back into the scheduler. The scheduler never runs a job's
//! business action itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{JobDetails, JobExecutionResponse, Result, TimerEvent, TimerJobScheduler};

/// Future returned by a [`JobExecutor`].
///
/// Resolves to `Ok(())` when the job's action succeeded and to an error
/// message otherwise.
pub type ExecutionFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Type alias for the job executor function.
pub type JobExecutor = Arc<dyn Fn(JobDetails) -> ExecutionFuture + Send + Sync>;

/// Wrap an async closure as a [`JobExecutor`].
pub fn job_executor<F, Fut>(f: F) -> JobExecutor
where
    F: Fn(JobDetails) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(move |job: JobDetails| -> ExecutionFuture { Box::pin(f(job)) })
}

/// Routes timer wakeups through the executor and back into the scheduler.
pub struct JobDispatcher {
    scheduler: Arc<TimerJobScheduler>,
    executor: JobExecutor,
}

impl JobDispatcher {
    pub fn new(scheduler: Arc<TimerJobScheduler>, executor: JobExecutor) -> Self {
        Self {
            scheduler,
            executor,
        }
    }

    /// Consume wakeups until shutdown or until the timer side hangs up.
    ///
    /// Each wakeup is handled on its own task so a slow job never holds up
    /// another. Executions already started are allowed to report back
    /// before this returns.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<TimerEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("dispatcher started");
        let this = Arc::new(self);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("timer event channel closed");
                        break;
                    };
                    let this = Arc::clone(&this);
                    in_flight.spawn(async move {
                        let job_id = event.job_id.clone();
                        if let Err(e) = this.dispatch(event).await {
                            error!(job_id = %job_id, error = %e, "failed to dispatch job");
                        }
                    });
                }

                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "waiting for in-flight executions");
        }
        while in_flight.join_next().await.is_some() {}
        info!("dispatcher stopped");
    }

    /// Handle one wakeup: execute the job and report the outcome.
    ///
    /// Returns the job as left by the scheduler, or `None` for a stale
    /// wakeup.
    pub async fn dispatch(&self, event: TimerEvent) -> Result<Option<JobDetails>> {
        let Some(job) = self.scheduler.on_timer_fired(&event).await? else {
            return Ok(None);
        };

        let job_id = job.id.clone();
        debug!(job_id = %job_id, retries = job.retries, "executing job");

        // Spawned so a panicking executor still yields an outcome.
        let response = match tokio::spawn((self.executor)(job)).await {
            Ok(Ok(())) => JobExecutionResponse::success(&job_id),
            Ok(Err(message)) => JobExecutionResponse::error(&job_id, message),
            Err(e) => JobExecutionResponse::error(&job_id, format!("executor panicked: {e}")),
        };

        self.scheduler
            .handle_execution_response(response)
            .await
            .map(Some)
    }
}
