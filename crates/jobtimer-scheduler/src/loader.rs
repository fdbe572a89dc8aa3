//! Chunked backlog loader.
//!
//! Keeps the number of live timers bounded: only jobs due within the next
//! chunk are armed, everything later stays in the repository until a pass
//! brings it inside the window. Passes run once when loading becomes active
//! and then every `load_job_interval_in_minutes`, never overlapping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{JobStatus, Result, TimerJobScheduler};

/// What one loader pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// Jobs armed (or deferred) by this pass.
    pub loaded: usize,
    /// Jobs already armed in this process.
    pub skipped: usize,
    /// Jobs retired as `ERROR` because they went overdue while down.
    pub expired: usize,
    /// Jobs that failed to load; logged and left for the next pass.
    pub failed: usize,
}

/// Periodically promotes due-soon persisted jobs into live timers.
pub struct JobLoader {
    scheduler: Arc<TimerJobScheduler>,
}

impl JobLoader {
    pub fn new(scheduler: Arc<TimerJobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Run one pass over the backlog.
    ///
    /// A job that fails to load is logged and counted; it never stops the
    /// rest of the pass.
    #[tracing::instrument(skip(self))]
    pub async fn load_pass(&self, on_service_start: bool) -> Result<LoadReport> {
        let config = self.scheduler.config();
        let now = Utc::now();
        let from = config
            .lookback()
            .map(|lookback| now - lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let to = now + config.chunk_window();

        let jobs = self
            .scheduler
            .repository()
            .find_due_between(from, to, &JobStatus::ACTIVE)
            .await?;

        let mut report = LoadReport::default();
        for job in jobs {
            if self.scheduler.registry().contains(&job.id) {
                report.skipped += 1;
                continue;
            }

            let job_id = job.id.clone();
            match self.scheduler.internal_schedule(job, on_service_start).await {
                Ok(Some(job)) if job.status == JobStatus::Error => report.expired += 1,
                Ok(Some(_)) => report.loaded += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(job_id = %job_id, error = %e, "failed to load job");
                }
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            expired = report.expired,
            failed = report.failed,
            "backlog load pass complete"
        );
        Ok(report)
    }

    /// Load the backlog while `ready_rx` reads true, until shutdown.
    ///
    /// Losing readiness suspends loading; regaining it starts over with an
    /// immediate pass. Only the first successful pass of a run treats
    /// overdue jobs as accumulated downtime. If the readiness sender goes
    /// away the last value sticks.
    pub async fn run(
        self,
        mut ready_rx: watch::Receiver<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("backlog loader started");
        let mut readiness_open = true;
        let mut on_service_start = true;

        'outer: loop {
            // Suspended until ready.
            while !*ready_rx.borrow_and_update() {
                debug!("backlog loading suspended, waiting for readiness");
                tokio::select! {
                    changed = ready_rx.changed() => {
                        if changed.is_err() {
                            info!("readiness signal closed while not ready");
                            break 'outer;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break 'outer;
                        }
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            let mut ticker = tokio::time::interval(self.scheduler.config().load_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break 'outer;
                        }
                    }

                    changed = ready_rx.changed(), if readiness_open => {
                        if changed.is_err() {
                            readiness_open = false;
                        } else if !*ready_rx.borrow() {
                            info!("readiness lost, suspending backlog loading");
                            continue 'outer;
                        }
                    }

                    _ = ticker.tick() => {
                        match self.load_pass(on_service_start).await {
                            Ok(_) => on_service_start = false,
                            Err(e) => error!(error = %e, "backlog load pass failed"),
                        }
                    }
                }
            }
        }

        info!("backlog loader stopped");
    }
}
