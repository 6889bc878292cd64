use async_trait::async_trait;
use std::time::Instant;
use tracing::info;

use crate::error::{BootError, Result};
use crate::logging::LogId;
use crate::metrics;
use crate::resource::Resources;

/// A one-off task runnable instead of the HTTP server. Jobs see the same
/// initialized resources the server would.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn run(&self, resources: &Resources, log_id: &LogId) -> anyhow::Result<()>;
}

/// The closed set of jobs this binary knows about.
pub struct JobRegistry {
    jobs: Vec<Box<dyn Job>>,
}

impl JobRegistry {
    pub fn builtin() -> Self {
        Self {
            jobs: vec![Box::new(PingJob), Box::new(CleanupJob)],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    pub fn find(&self, name: &str) -> Result<&dyn Job> {
        self.jobs
            .iter()
            .map(|job| job.as_ref())
            .find(|job| job.name() == name)
            .ok_or_else(|| BootError::UnknownJob(name.to_string()))
    }

    /// Look a job up and run it once, with timing and a success counter.
    pub async fn run(&self, name: &str, resources: &Resources) -> Result<()> {
        let job = self.find(name)?;
        let log_id = LogId::generate();
        let start = Instant::now();
        info!(job = job.name(), log_id = %log_id, "job starting");

        let outcome = job.run(resources, &log_id).await;
        metrics::record_job_run(job.name(), outcome.is_ok());

        match outcome {
            Ok(()) => {
                info!(
                    job = job.name(),
                    log_id = %log_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "job finished"
                );
                Ok(())
            }
            Err(source) => Err(BootError::Job {
                name: job.name().to_string(),
                source,
            }),
        }
    }
}

/// Probes every backing service and fails if any of them is down.
struct PingJob;

#[async_trait]
impl Job for PingJob {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn description(&self) -> &'static str {
        "probe the database and cache once, then exit"
    }

    async fn run(&self, resources: &Resources, log_id: &LogId) -> anyhow::Result<()> {
        let report = resources.probe(log_id).await;
        info!(
            database = report.database,
            cache = report.cache,
            tracer_active = report.tracer_active,
            "probe results"
        );
        if report.ok() {
            Ok(())
        } else {
            anyhow::bail!(
                "probe failed: database={} cache={}",
                report.database,
                report.cache
            )
        }
    }
}

/// Removes stale coordination state: the startup lock key and task-run rows
/// older than a week.
struct CleanupJob;

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn description(&self) -> &'static str {
        "drop stale locks and prune old task-run records"
    }

    async fn run(&self, resources: &Resources, log_id: &LogId) -> anyhow::Result<()> {
        // The lock key is plumbing, not application data, so it goes through
        // the raw pool rather than the instrumented client.
        let mut conn = resources.cache_pool.checkout().await?;
        let dropped: u64 = redis::cmd("DEL")
            .arg("gantry:startup:lock")
            .query_async(&mut conn)
            .await?;

        let pruned = resources
            .db
            .execute(
                log_id,
                "DELETE FROM task_runs WHERE finished_at < NOW() - INTERVAL 7 DAY",
            )
            .await?;
        info!(
            locks_dropped = dropped,
            rows_pruned = pruned,
            "cleanup finished"
        );
        Ok(())
    }
}
