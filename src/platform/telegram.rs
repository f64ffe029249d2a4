use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, FileId, InputFile, MessageId, ParseMode, Recipient, UpdateKind,
};
use teloxide::RequestError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::{TransportError, TransportErrorKind, TransportResult};
use crate::message::{DeliveryReceipt, MediaDescriptor, RawMessage};

const POLL_TIMEOUT_SECS: u32 = 30;
const POLL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
const INBOUND_BUFFER: usize = 256;

/// Bot API transport: long-polls channel posts and sends through the same bot
pub struct TelegramTransport {
    bot: Bot,
    cancel: CancellationToken,
}

impl TelegramTransport {
    /// Verify the token and clear any webhook so long polling works
    pub async fn connect(token: &str, cancel: CancellationToken) -> Result<Self> {
        // client timeout must outlast the long-poll timeout
        let client = teloxide::net::default_reqwest_settings()
            .timeout(std::time::Duration::from_secs(45))
            .build()
            .context("Failed to build HTTP client")?;
        let bot = Bot::with_client(token, client);

        let me = bot.get_me().await.context("Failed to verify bot token")?;
        bot.delete_webhook()
            .await
            .context("Failed to clear webhook")?;
        info!("Telegram bot connected: {} (@{:?})", me.first_name, me.username);

        Ok(Self { bot, cancel })
    }
}

/// Parse a configured channel into a recipient: numeric ids or `@username`
fn recipient(channel: &str) -> Recipient {
    match channel.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(channel.to_string()),
    }
}

fn channel_name(msg: &Message) -> String {
    match msg.chat.username() {
        Some(username) => format!("@{}", username),
        None => msg.chat.id.0.to_string(),
    }
}

fn is_watched(sources: &[String], msg: &Message) -> bool {
    let name = channel_name(msg);
    let id = msg.chat.id.0.to_string();
    sources
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&name) || *s == id)
}

fn media_of(msg: &Message) -> Option<MediaDescriptor> {
    if let Some(sizes) = msg.photo() {
        // last size is the largest
        return sizes.last().map(|ps| MediaDescriptor::Photo {
            file_id: ps.file.id.to_string(),
        });
    }
    msg.document().map(|doc| MediaDescriptor::Document {
        file_id: doc.file.id.to_string(),
        file_name: doc.file_name.clone(),
        mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
    })
}

/// Re-upload by file id; the platform keeps the original bytes
fn upload_id(media: &MediaDescriptor) -> FileId {
    FileId(media.file_id().to_owned())
}

fn to_raw(msg: &Message) -> RawMessage {
    RawMessage {
        id: i64::from(msg.id.0),
        chat_id: msg.chat.id.0,
        channel: channel_name(msg),
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        media: media_of(msg),
        date: msg.date,
    }
}

fn map_error(err: RequestError) -> TransportError {
    let message = err.to_string();
    match &err {
        RequestError::RetryAfter(wait) => TransportError {
            kind: TransportErrorKind::FloodWait,
            message,
            retry_after: Some(wait.duration()),
        },
        RequestError::Api(_) if is_entity_error(&message) => TransportError::entity_bounds(message),
        RequestError::Network(_) | RequestError::Io(_) => TransportError::network(message),
        _ => TransportError::api(message),
    }
}

fn is_entity_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("can't parse entities") || lower.contains("invalid bounds")
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn listen(&self, sources: &[String]) -> TransportResult<BoxStream<'static, RawMessage>> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let bot = self.bot.clone();
        let cancel = self.cancel.clone();
        let sources = sources.to_vec();

        tokio::spawn(async move {
            info!("Starting telegram polling loop");
            let mut offset: i32 = 0;

            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = bot
                        .get_updates()
                        .offset(offset)
                        .timeout(POLL_TIMEOUT_SECS)
                        .allowed_updates(vec![AllowedUpdate::ChannelPost, AllowedUpdate::Message]) => result,
                };

                let updates = match result {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!("Telegram getUpdates failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                        }
                    }
                };

                for update in updates {
                    offset = update.id.as_offset();
                    let msg = match update.kind {
                        UpdateKind::ChannelPost(msg) | UpdateKind::Message(msg) => msg,
                        other => {
                            debug!("Ignoring non-message update: {:?}", other);
                            continue;
                        }
                    };

                    if !is_watched(&sources, &msg) {
                        debug!(chat = %channel_name(&msg), "Skipping message from unwatched chat");
                        continue;
                    }
                    debug!(chat = %channel_name(&msg), id = msg.id.0, "Received message");
                    if tx.send(to_raw(&msg)).await.is_err() {
                        info!("Listener dropped, stopping telegram polling");
                        return;
                    }
                }
            }
            info!("Telegram polling stopped");
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(stream.boxed())
    }

    async fn deliver(
        &self,
        destination: &str,
        text: &str,
        formatting: bool,
        media: Option<&MediaDescriptor>,
    ) -> TransportResult<DeliveryReceipt> {
        let to = recipient(destination);
        let sent = match media {
            None => {
                let request = self.bot.send_message(to, text);
                if formatting {
                    request.parse_mode(ParseMode::Html).await
                } else {
                    request.await
                }
            }
            Some(media) => {
                let file = InputFile::file_id(upload_id(media));
                match media {
                    MediaDescriptor::Photo { .. } => {
                        let request = self.bot.send_photo(to, file).caption(text);
                        if formatting {
                            request.parse_mode(ParseMode::Html).await
                        } else {
                            request.await
                        }
                    }
                    MediaDescriptor::Document { .. } => {
                        let request = self.bot.send_document(to, file).caption(text);
                        if formatting {
                            request.parse_mode(ParseMode::Html).await
                        } else {
                            request.await
                        }
                    }
                }
            }
        };

        sent.map(|msg| DeliveryReceipt {
            message_id: i64::from(msg.id.0),
        })
        .map_err(map_error)
    }

    async fn forward_native(
        &self,
        destination: &str,
        message: &RawMessage,
    ) -> TransportResult<DeliveryReceipt> {
        let message_id = i32::try_from(message.id)
            .map_err(|_| TransportError::api(format!("message id {} out of range", message.id)))?;
        self.bot
            .forward_message(
                recipient(destination),
                ChatId(message.chat_id),
                MessageId(message_id),
            )
            .await
            .map(|msg| DeliveryReceipt {
                message_id: i64::from(msg.id.0),
            })
            .map_err(map_error)
    }
}
