//! Daemon command for running the scheduler.
//!
//! The daemon wires the engine together:
//! - In-memory repository seeded from the backlog file
//! - Tokio timers, one sleeping task per armed job
//! - Dispatcher routing elapsed timers through a logging executor
//! - Backlog loader promoting jobs as they come inside the chunk
//! - Status change stream logged and optionally written to stdout

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use jobtimer_scheduler::{
    BroadcastPublisher, InMemoryJobRepository, JobDetails, JobDispatcher, JobEventPublisher,
    JobExecutor, JobLoader, SchedulerConfig, TimerJobScheduler, TokioTimerService,
    TracingPublisher, job_executor,
};

use crate::seed;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    /// Backlog to start from; empty when unset.
    pub jobs_file: Option<PathBuf>,
    /// Write each status change to stdout as a JSON line.
    pub emit_events: bool,
    pub event_buffer: usize,
}

/// Executor that only records the firing. Stands in for a real callback.
fn logging_executor() -> JobExecutor {
    job_executor(|job: JobDetails| async move {
        info!(
            job_id = %job.id,
            retries = job.retries,
            executions = job.execution_counter,
            correlation = ?job.correlation,
            "job fired"
        );
        Ok(())
    })
}

/// Run the daemon until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let backlog = match &config.jobs_file {
        Some(path) => seed::load_jobs(path).await?,
        None => Vec::new(),
    };
    info!(jobs = backlog.len(), "starting jobtimer daemon");

    let repository = Arc::new(InMemoryJobRepository::with_jobs(backlog));
    let (timer, timer_events) = TokioTimerService::new();
    let publisher = Arc::new(BroadcastPublisher::new(config.event_buffer.max(1)));
    let status_rx = publisher.subscribe();

    let scheduler = Arc::new(
        TimerJobScheduler::new(config.scheduler, repository, Arc::new(timer), publisher)
            .map_err(|e| miette::miette!("{}", e))?,
    );

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received ctrl-c, shutting down");
        let _ = shutdown_tx_clone.send(true);
    });

    // Nothing external gates loading here, so the service is ready from the start.
    let (_ready_tx, ready_rx) = watch::channel(true);

    let status_handle = tokio::spawn(log_status_changes(
        status_rx,
        config.emit_events,
        shutdown_rx.clone(),
    ));

    let dispatcher = JobDispatcher::new(scheduler.clone(), logging_executor());
    let dispatcher_handle = tokio::spawn(dispatcher.run(timer_events, shutdown_rx.clone()));

    let loader = JobLoader::new(scheduler.clone());
    let loader_handle = tokio::spawn(loader.run(ready_rx, shutdown_rx));

    if let Err(e) = loader_handle.await {
        warn!(error = %e, "backlog loader task failed");
    }
    if let Err(e) = dispatcher_handle.await {
        warn!(error = %e, "dispatcher task failed");
    }

    scheduler.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = status_handle.await {
        warn!(error = %e, "status logger task failed");
    }

    info!("jobtimer daemon stopped");
    Ok(())
}

/// Log every status change and optionally echo it to stdout.
async fn log_status_changes(
    mut status_rx: broadcast::Receiver<JobDetails>,
    emit_events: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            received = status_rx.recv() => match received {
                Ok(job) => {
                    TracingPublisher.publish_status_change(&job);
                    if emit_events {
                        match serde_json::to_string(&job) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!(job_id = %job.id, error = %e, "failed to encode status change"),
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status logger lagging, dropped status changes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
