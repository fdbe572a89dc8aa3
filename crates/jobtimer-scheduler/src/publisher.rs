//! Status change notifications.

use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::JobDetails;

/// Receives every job status transition. Fire-and-forget: the scheduler
/// never waits on a publisher.
pub trait JobEventPublisher: Send + Sync {
    fn publish_status_change(&self, job: &JobDetails);
}

/// Logs each transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl JobEventPublisher for TracingPublisher {
    fn publish_status_change(&self, job: &JobDetails) {
        info!(
            job_id = %job.id,
            status = %job.status,
            retries = job.retries,
            executions = job.execution_counter,
            "job status changed"
        );
    }
}

/// Fans transitions out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than blocking
/// the scheduler.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<JobDetails>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobDetails> {
        self.tx.subscribe()
    }
}

impl JobEventPublisher for BroadcastPublisher {
    fn publish_status_change(&self, job: &JobDetails) {
        if self.tx.send(job.clone()).is_err() {
            trace!(job_id = %job.id, "no status subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobStatus, Trigger};
    use chrono::Utc;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let publisher = BroadcastPublisher::new(16);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        let job = JobDetails::new("job-1", Trigger::at(Utc::now())).snapshot(JobStatus::Retry);
        publisher.publish_status_change(&job);

        assert_eq!(a.recv().await.unwrap().status, JobStatus::Retry);
        assert_eq!(b.recv().await.unwrap().id, "job-1");
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_panic() {
        let publisher = BroadcastPublisher::new(1);
        let job = JobDetails::new("job-1", Trigger::at(Utc::now()));
        publisher.publish_status_change(&job);
        TracingPublisher.publish_status_change(&job);
    }
}
