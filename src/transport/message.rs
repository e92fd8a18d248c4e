//! Inbound message types shared by the transport and the pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque chat handle in the external transport (channel, group or user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChatId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ChatId)
    }
}

/// A media attachment already stored by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Transport-side file handle; resending by handle avoids re-uploading.
    pub file_id: String,
    pub caption: Option<String>,
}

impl MediaRef {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// Message payload, one variant per kind the relay knows how to resend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Photo(MediaRef),
    Video(MediaRef),
    Document(MediaRef),
    Audio(MediaRef),
    Voice(MediaRef),
    VideoNote { file_id: String },
    Sticker { file_id: String },
    /// Polls and anything unrecognised, relayed with the native forward.
    Other,
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Photo(_) => "photo",
            Self::Video(_) => "video",
            Self::Document(_) => "document",
            Self::Audio(_) => "audio",
            Self::Voice(_) => "voice",
            Self::VideoNote { .. } => "video_note",
            Self::Sticker { .. } => "sticker",
            Self::Other => "other",
        }
    }
}

/// A message observed on a monitored source chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub source: ChatId,
    /// Transport-native message id within `source`.
    pub message_id: i64,
    pub content: MessageContent,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(source: ChatId, message_id: i64, content: MessageContent) -> Self {
        Self {
            source,
            message_id,
            content,
            received_at: Utc::now(),
        }
    }

    /// Shorthand for a plain-text message.
    pub fn text(source: ChatId, message_id: i64, text: impl Into<String>) -> Self {
        Self::new(source, message_id, MessageContent::Text { text: text.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_parses_negative_channel_ids() {
        let id: ChatId = " -1001234567890 ".parse().unwrap();
        assert_eq!(id, ChatId(-1_001_234_567_890));
        assert_eq!(id.to_string(), "-1001234567890");
        assert!("@channel".parse::<ChatId>().is_err());
    }

    #[test]
    fn content_serializes_with_kind_tag() {
        let content = MessageContent::Photo(MediaRef::new("AgAD").with_caption("look"));
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "photo");
        assert_eq!(json["file_id"], "AgAD");
        assert_eq!(json["caption"], "look");
        assert_eq!(content.kind(), "photo");
    }
}
