//! Job backlog files.
//!
//! A backlog file is a JSON array of jobs:
//!
//! ```json
//! [
//!   { "id": "report", "trigger": { "type": "point_in_time", "at": "2026-01-01T09:00:00Z" } },
//!   { "trigger": { "type": "interval", "start": "2026-01-01T00:00:00Z",
//!                  "interval_millis": 3600000, "repeat_limit": -1 },
//!     "priority": 5, "correlation": { "tenant": "acme" } }
//! ]
//! ```
//!
//! Jobs without an id get a random one. Anything [`JobDetails`] carries
//! beyond these fields starts from its defaults.

use std::path::Path;

use miette::Result;
use serde::Deserialize;
use tracing::debug;

use jobtimer_scheduler::{JobDetails, JobStatus, Trigger};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedJob {
    id: Option<String>,
    trigger: Trigger,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    priority: i32,
    correlation: Option<serde_json::Value>,
}

impl SeedJob {
    fn into_job(self) -> JobDetails {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut job = JobDetails::new(id, self.trigger).with_priority(self.priority);
        if let Some(correlation) = self.correlation {
            job = job.with_correlation(correlation);
        }
        job.status = self.status.unwrap_or_default();
        job.retries = self.retries;
        job
    }
}

/// Parse a backlog document.
pub fn parse_jobs(json: &str) -> Result<Vec<JobDetails>> {
    let seeds: Vec<SeedJob> =
        serde_json::from_str(json).map_err(|e| miette::miette!("invalid job backlog: {}", e))?;
    let jobs: Vec<JobDetails> = seeds.into_iter().map(SeedJob::into_job).collect();

    let mut ids = std::collections::HashSet::new();
    for job in &jobs {
        if !ids.insert(job.id.as_str()) {
            return Err(miette::miette!("duplicate job id in backlog: {}", job.id));
        }
        if job.status.is_terminal() {
            return Err(miette::miette!(
                "job {} has terminal status {}; terminal jobs are never stored",
                job.id,
                job.status
            ));
        }
    }

    Ok(jobs)
}

/// Read and parse a backlog file.
pub async fn load_jobs(path: &Path) -> Result<Vec<JobDetails>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    let jobs = parse_jobs(&json)?;
    debug!(path = %path.display(), count = jobs.len(), "loaded job backlog");
    Ok(jobs)
}
