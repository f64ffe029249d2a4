pub mod telegram;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportResult;
use crate::message::{DeliveryReceipt, MediaDescriptor, RawMessage};

/// The chat-platform capability the relay is built on.
///
/// Connection, authentication and wire protocol live behind this trait;
/// the pipeline only observes and sends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stream of new messages from the given source channels. Ends when the
    /// transport disconnects or is cancelled.
    async fn listen(&self, sources: &[String]) -> TransportResult<BoxStream<'static, RawMessage>>;

    /// Send `text` to `destination`, optionally with parse-mode formatting and
    /// an attachment (the text then becomes its caption).
    async fn deliver(
        &self,
        destination: &str,
        text: &str,
        formatting: bool,
        media: Option<&MediaDescriptor>,
    ) -> TransportResult<DeliveryReceipt>;

    /// Platform-native forward of the original message
    async fn forward_native(
        &self,
        destination: &str,
        message: &RawMessage,
    ) -> TransportResult<DeliveryReceipt>;
}
