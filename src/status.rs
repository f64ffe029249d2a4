use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::pipeline::ForwardPipeline;
use crate::platform::Transport;
use crate::policy::rate::{RateUsage, WindowUsage};

/// Point-in-time view of the pipeline state for operators
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Wall-clock time in the reference zone
    pub taken_at: String,
    pub uptime: Duration,
    pub rate: RateUsage,
    pub delay_multiplier: f64,
    pub consecutive_errors: u32,
    pub paused: bool,
    pub pause_until: Option<String>,
    pub dedup_size: usize,
    pub work_hour: bool,
    pub safe_hour: bool,
}

fn check(ok: bool) -> &'static str {
    if ok {
        "✅"
    } else {
        "❌"
    }
}

fn window(label: &str, usage: &WindowUsage) -> String {
    format!("  • {}: {}/{}", label, usage.count, usage.ceiling)
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}d {:02}h {:02}m", secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60)
}

impl StatusSnapshot {
    pub fn render(&self) -> String {
        let availability = if self.paused { "⏸️ paused" } else { "✅ active" };
        let lines = [
            "📊 Relay status".to_string(),
            format!("⏰ Time: {}", self.taken_at),
            format!("⌛ Uptime: {}", format_uptime(self.uptime)),
            format!("🎯 State: {}", availability),
            format!(
                "⏳ Paused until: {}",
                self.pause_until.as_deref().unwrap_or("none")
            ),
            "📈 Sends:".to_string(),
            window("minute", &self.rate.minute),
            window("hour", &self.rate.hour),
            window("day", &self.rate.day),
            "⚙️ Checks:".to_string(),
            format!("  • Work hours: {}", check(self.work_hour)),
            format!("  • Safe hours: {}", check(self.safe_hour)),
            format!("  • Processed ids cached: {}", self.dedup_size),
            format!("  • Delay multiplier: {:.2}", self.delay_multiplier),
            format!("  • Consecutive errors: {}", self.consecutive_errors),
        ];
        lines.join("\n")
    }
}

/// Take a snapshot, log it, and deliver it to the log channel when configured
pub async fn report(
    pipeline: &ForwardPipeline,
    transport: &Arc<dyn Transport>,
    channel: Option<&str>,
) {
    let snapshot = pipeline.snapshot().await;
    if let Ok(json) = serde_json::to_string(&snapshot) {
        debug!(snapshot = %json, "Status snapshot");
    }

    let text = snapshot.render();
    info!("{}", text);

    let Some(channel) = channel else {
        return;
    };
    match transport.deliver(channel, &text, false, None).await {
        Ok(_) => info!("Sent status report"),
        Err(e) => warn!("Failed to send status report: {}", e),
    }
}
