use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::backoff::ErrorClass;

/// Attachment carried by a source message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDescriptor {
    Photo {
        file_id: String,
    },
    Document {
        file_id: String,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
}

impl MediaDescriptor {
    pub fn file_id(&self) -> &str {
        match self {
            MediaDescriptor::Photo { file_id } => file_id,
            MediaDescriptor::Document { file_id, .. } => file_id,
        }
    }

    /// Human-readable description used in fallback notes
    pub fn describe(&self) -> String {
        match self {
            MediaDescriptor::Photo { .. } => "photo".to_string(),
            MediaDescriptor::Document {
                file_name,
                mime_type,
                ..
            } => {
                let mime = mime_type.as_deref().unwrap_or("unknown");
                match file_name {
                    Some(name) => format!("document (MIME: {}, file: {})", mime, name),
                    None => format!("document (MIME: {})", mime),
                }
            }
        }
    }
}

/// A message observed on a source channel. Immutable once received.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Source-scoped message id
    pub id: i64,
    /// Numeric chat id of the source
    pub chat_id: i64,
    /// Display form of the source: `@username` when available, else the chat id
    pub channel: String,
    pub text: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub date: DateTime<Utc>,
}

impl RawMessage {
    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity {
            channel: self.channel.clone(),
            message_id: self.id,
        }
    }
}

/// Dedup key: one per physical source event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MessageIdentity {
    pub channel: String,
    pub message_id: i64,
}

impl MessageIdentity {
    pub fn new(channel: impl Into<String>, message_id: i64) -> Self {
        Self {
            channel: channel.into(),
            message_id,
        }
    }
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.message_id)
    }
}

/// What the transport hands back for a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    /// Formatted send was rejected; text went out unformatted
    PlainText,
    /// Native forward failed; media was re-uploaded with a caption
    MediaReuploaded,
    /// Media could not be relayed; a text note was sent instead
    MediaNoteOnly,
    /// Every media stage failed; only the text portion arrived
    MediaDropped,
    /// Stopped before every destination received the text
    PartialDestinations,
}

impl DegradeReason {
    /// Higher is worse; used to keep the most severe reason across destinations
    fn severity(self) -> u8 {
        match self {
            DegradeReason::PlainText => 0,
            DegradeReason::MediaReuploaded => 1,
            DegradeReason::MediaNoteOnly => 2,
            DegradeReason::MediaDropped => 3,
            DegradeReason::PartialDestinations => 4,
        }
    }

    pub fn worst(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.severity() > a.severity() { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

/// Result of one pipeline pass for a message that reached the send stage
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    DeliveredDegraded(DegradeReason),
    /// The failure moved the pipeline into the paused state
    Rejected(ErrorClass),
    /// The pipeline slept this cooldown before returning
    Deferred(Duration),
}

/// Why a message never reached the send stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    RelayedLog,
    Paused,
    OutsideWorkWindow,
    UnsafeHour,
    RateLimited,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Skipped(SkipReason),
    Attempted(DeliveryOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = MessageIdentity::new("@chanA", 42);
        assert_eq!(id.to_string(), "@chanA:42");
    }

    #[test]
    fn test_document_description() {
        let doc = MediaDescriptor::Document {
            file_id: "f".into(),
            file_name: Some("cv.pdf".into()),
            mime_type: Some("application/pdf".into()),
        };
        assert_eq!(doc.describe(), "document (MIME: application/pdf, file: cv.pdf)");

        let bare = MediaDescriptor::Document {
            file_id: "f".into(),
            file_name: None,
            mime_type: None,
        };
        assert_eq!(bare.describe(), "document (MIME: unknown)");
    }

    #[test]
    fn test_worst_degrade_reason() {
        assert_eq!(DegradeReason::worst(None, None), None);
        assert_eq!(
            DegradeReason::worst(Some(DegradeReason::PlainText), None),
            Some(DegradeReason::PlainText)
        );
        assert_eq!(
            DegradeReason::worst(
                Some(DegradeReason::MediaReuploaded),
                Some(DegradeReason::PlainText)
            ),
            Some(DegradeReason::MediaReuploaded)
        );
        assert_eq!(
            DegradeReason::worst(
                Some(DegradeReason::PlainText),
                Some(DegradeReason::MediaDropped)
            ),
            Some(DegradeReason::MediaDropped)
        );
    }
}
