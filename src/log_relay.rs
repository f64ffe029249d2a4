//! Batches INFO+ log lines into a chat channel.
//!
//! [`LogRelayLayer`] is installed on the tracing registry before the
//! transport exists; [`run`] is spawned later with the receiving half and the
//! transport. Events emitted from this module are never relayed, so a failing
//! log channel cannot feed itself.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::platform::Transport;
use crate::sanitize;

/// Heading of every relayed log message; inbound messages containing it are ignored
pub const LOG_MARKER: &str = "📋 System log";

const QUEUE_CAPACITY: usize = 1000;
const BATCH_SIZE: usize = 10;
const BATCH_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINES_PER_MESSAGE: usize = 20;

/// Tracing layer that queues formatted events for the relay task
pub struct LogRelayLayer {
    tx: mpsc::Sender<String>,
}

pub fn channel() -> (LogRelayLayer, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (LogRelayLayer { tx }, rx)
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for LogRelayLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(module_path!()) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!("{:<5} {}{}", meta.level(), visitor.message, visitor.fields);

        // queue full or relay gone: drop the line
        let _ = self.tx.try_send(line);
    }
}

/// HTML message with the newest lines in a preformatted block
fn render_batch(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(MAX_LINES_PER_MESSAGE);
    format!(
        "{}\n<pre>{}</pre>",
        LOG_MARKER,
        sanitize::to_html(&lines[start..].join("\n"))
    )
}

/// Drain queued lines into `channel` until cancelled or the queue closes
pub async fn run(
    mut rx: mpsc::Receiver<String>,
    transport: Arc<dyn Transport>,
    channel: String,
    cancel: CancellationToken,
) {
    let mut batch: Vec<String> = Vec::new();
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + BATCH_TIMEOUT, BATCH_TIMEOUT);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&mut batch, transport.as_ref(), &channel).await;
                break;
            }
            line = rx.recv() => {
                let Some(line) = line else {
                    flush(&mut batch, transport.as_ref(), &channel).await;
                    break;
                };
                batch.push(line);
                if batch.len() >= BATCH_SIZE {
                    flush(&mut batch, transport.as_ref(), &channel).await;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&mut batch, transport.as_ref(), &channel).await;
                }
            }
        }
    }
}

async fn flush(batch: &mut Vec<String>, transport: &dyn Transport, channel: &str) {
    if batch.is_empty() {
        return;
    }
    let text = render_batch(batch);
    match transport.deliver(channel, &text, true, None).await {
        Ok(_) => batch.clear(),
        Err(e) => {
            tracing::warn!("Failed to relay logs to {}: {}", channel, e);
            // keep the newest lines for the next attempt
            let excess = batch.len().saturating_sub(MAX_LINES_PER_MESSAGE);
            batch.drain(..excess);
        }
    }
}
