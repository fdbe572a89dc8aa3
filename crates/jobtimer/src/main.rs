//! jobtimer: durable timer-based job scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Run the scheduler over a seeded backlog until ctrl-c
//! - `check`: Validate a configuration and a job backlog file

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobtimer_scheduler::SchedulerConfig;

mod daemon;
mod seed;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "jobtimer")]
#[command(about = "Durable timer-based job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Scheduler settings shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
struct SchedulerArgs {
    /// Delay between retries of a failed job, in milliseconds
    #[arg(long, env = "JOBTIMER_BACKOFF_RETRY_MILLIS", default_value = "1000")]
    backoff_retry_millis: u64,

    /// Overall retry budget, in milliseconds
    #[arg(
        long,
        env = "JOBTIMER_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS",
        default_value = "60000"
    )]
    max_interval_limit_to_retry_millis: u64,

    /// Only jobs due within this many minutes hold a live timer
    #[arg(long, env = "JOBTIMER_SCHEDULER_CHUNK_IN_MINUTES", default_value = "10")]
    scheduler_chunk_in_minutes: u64,

    /// Minutes between backlog load passes
    #[arg(long, env = "JOBTIMER_LOAD_JOB_INTERVAL_IN_MINUTES", default_value = "10")]
    load_job_interval_in_minutes: u64,

    /// How far back a load pass looks for overdue jobs, in minutes (0 = no limit)
    #[arg(
        long,
        env = "JOBTIMER_LOAD_JOB_FROM_CURRENT_TIME_INTERVAL_IN_MINUTES",
        default_value = "0"
    )]
    load_job_from_current_time_interval_in_minutes: u64,

    /// Run jobs scheduled in the past immediately instead of rejecting them
    #[arg(
        long,
        env = "JOBTIMER_FORCE_EXECUTE_EXPIRED_JOBS",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = parse_bool_env
    )]
    force_execute_expired_jobs: bool,

    /// Run jobs that went overdue while the service was down
    #[arg(
        long,
        env = "JOBTIMER_FORCE_EXECUTE_EXPIRED_JOBS_ON_SERVICE_START",
        default_value = "false",
        action = ArgAction::Set,
        value_parser = parse_bool_env
    )]
    force_execute_expired_jobs_on_service_start: bool,
}

impl From<SchedulerArgs> for SchedulerConfig {
    fn from(args: SchedulerArgs) -> Self {
        SchedulerConfig {
            backoff_retry_millis: args.backoff_retry_millis,
            max_interval_limit_to_retry_millis: args.max_interval_limit_to_retry_millis,
            scheduler_chunk_in_minutes: args.scheduler_chunk_in_minutes,
            load_job_interval_in_minutes: args.load_job_interval_in_minutes,
            load_job_from_current_time_interval_in_minutes: args
                .load_job_from_current_time_interval_in_minutes,
            force_execute_expired_jobs: args.force_execute_expired_jobs,
            force_execute_expired_jobs_on_service_start: args
                .force_execute_expired_jobs_on_service_start,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Daemon {
        #[command(flatten)]
        scheduler: SchedulerArgs,

        /// JSON file with the persisted job backlog to start from
        #[arg(long, env = "JOBTIMER_JOBS")]
        jobs: Option<PathBuf>,

        /// Write every job status change to stdout as a JSON line
        #[arg(
            long,
            env = "JOBTIMER_EMIT_EVENTS",
            default_value = "false",
            action = ArgAction::Set,
            value_parser = parse_bool_env
        )]
        emit_events: bool,

        /// Status events buffered per subscriber before the oldest are dropped
        #[arg(long, default_value = "1024")]
        event_buffer: usize,
    },

    /// Validate the configuration and a job backlog file, then exit
    Check {
        #[command(flatten)]
        scheduler: SchedulerArgs,

        /// JSON file with the job backlog
        #[arg(long)]
        jobs: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "jobtimer=info,jobtimer_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            scheduler,
            jobs,
            emit_events,
            event_buffer,
        } => {
            daemon::run(daemon::DaemonConfig {
                scheduler: scheduler.into(),
                jobs_file: jobs,
                emit_events,
                event_buffer,
            })
            .await?;
        }
        Commands::Check { scheduler, jobs } => {
            let config = SchedulerConfig::from(scheduler)
                .validate()
                .map_err(|e| miette::miette!("{}", e))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&config).map_err(|e| miette::miette!("{}", e))?
            );

            if let Some(path) = jobs {
                let backlog = seed::load_jobs(&path).await?;
                let active = backlog.iter().filter(|j| j.due_time().is_some()).count();
                println!(
                    "{}: {} jobs, {} with a next occurrence",
                    path.display(),
                    backlog.len(),
                    active
                );
            }
        }
    }

    Ok(())
}
