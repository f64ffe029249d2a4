pub mod tasks;

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Boxed future produced by a job on every tick
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cron runner for the relay's periodic jobs (resume monitor, status report)
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Register `task` to run on `cron_expr` (six fields, seconds first)
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                debug!("Running job: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Invalid cron expression for {}: {}", name, cron_expr))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    /// Start running registered jobs
    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    /// Stop the scheduler; jobs already running are not awaited
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shut down scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
