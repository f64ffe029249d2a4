mod config;
mod error;
mod log_relay;
mod message;
mod pipeline;
mod platform;
mod policy;
mod sanitize;
mod scheduler;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::Config;
use crate::pipeline::ForwardPipeline;
use crate::platform::telegram::TelegramTransport;
use crate::platform::Transport;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Lines queue up until the relay task starts; without a log channel the
    // receiver is dropped and the layer discards everything.
    let (relay_layer, relay_rx) = log_relay::channel();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chanrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(relay_layer.with_filter(LevelFilter::INFO))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Sources: {:?}", config.telegram.sources);
    info!("  Destinations: {:?}", config.telegram.destinations);
    info!(
        "  Rate ceilings: {}/min {}/h {}/day",
        config.rate.per_minute, config.rate.per_hour, config.rate.per_day
    );
    info!(
        "  Work hours: {}-{} {}",
        config.schedule.work_start_hour, config.schedule.work_end_hour, config.schedule.timezone
    );
    info!("  Log channel: {:?}", config.logging.channel);

    let cancel = CancellationToken::new();
    let transport: Arc<dyn Transport> = Arc::new(
        TelegramTransport::connect(&config.telegram.bot_token, cancel.clone()).await?,
    );
    let pipeline = Arc::new(ForwardPipeline::new(&config, transport.clone(), cancel.clone()));

    let relay_task = match config.logging.channel.clone() {
        Some(channel) => Some(tokio::spawn(log_relay::run(
            relay_rx,
            transport.clone(),
            channel,
            cancel.clone(),
        ))),
        None => {
            drop(relay_rx);
            None
        }
    };

    let mut scheduler = Scheduler::new().await?;
    scheduler::tasks::register_relay_tasks(
        &scheduler,
        pipeline.clone(),
        transport.clone(),
        &config.status,
        config.logging.channel.clone(),
    )
    .await?;
    scheduler.start().await?;

    let stop = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down");
        stop.cancel();
    });

    status::report(&pipeline, &transport, config.logging.channel.as_deref()).await;

    info!("Relay is starting...");
    let result = pipeline.clone().run(&config.telegram.sources).await;

    cancel.cancel();
    if let Err(e) = scheduler.shutdown().await {
        warn!("{:#}", e);
    }
    if let Some(task) = relay_task {
        let _ = task.await;
    }
    info!("Relay stopped");

    result
}
