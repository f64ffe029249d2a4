use std::sync::Arc;

use tracing::info;

use crate::config::StatusConfig;
use crate::pipeline::ForwardPipeline;
use crate::platform::Transport;
use crate::scheduler::Scheduler;
use crate::status;

/// Register the resume monitor and the periodic status report
pub async fn register_relay_tasks(
    scheduler: &Scheduler,
    pipeline: Arc<ForwardPipeline>,
    transport: Arc<dyn Transport>,
    status_config: &StatusConfig,
    log_channel: Option<String>,
) -> anyhow::Result<()> {
    let monitored = pipeline.clone();
    scheduler
        .add_cron_job(&status_config.monitor_cron, "resume-monitor", move || {
            let pipeline = monitored.clone();
            Box::pin(async move {
                if pipeline.try_resume().await {
                    info!("Pause elapsed, relay is active again");
                }
            })
        })
        .await?;

    scheduler
        .add_cron_job(&status_config.report_cron, "status-report", move || {
            let pipeline = pipeline.clone();
            let transport = transport.clone();
            let channel = log_channel.clone();
            Box::pin(async move {
                status::report(&pipeline, &transport, channel.as_deref()).await;
            })
        })
        .await?;

    Ok(())
}
