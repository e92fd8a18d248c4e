//! Telegram transport: long-polls the Bot API for channel posts and
//! resends them by file handle.
//!
//! Failed responses are mapped onto the relay's `TransportError` taxonomy
//! by `classify_failure`; nothing above this module looks at HTTP status
//! codes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::TelegramConfig;
use crate::error::{PermissionScope, TransportError};
use crate::transport::{ChatId, InboundMessage, MediaRef, MessageContent, MessageStream, Transport};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Cooldown assumed when a 429 arrives without `retry_after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Pause between long-poll attempts after a poll error.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const TRANSPORT_NAME: &str = "telegram";

/// A single Bot API call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: &'static str,
    pub body: Value,
}

/// Error payload of a failed Bot API call.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    bot_token: SecretString,
    api_base: String,
    poll_timeout_secs: u64,
    poll_error_backoff: Duration,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            poll_timeout_secs: config.poll_timeout_secs,
            poll_error_backoff: POLL_ERROR_BACKOFF,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Execute one Bot API call and classify a failure.
    async fn call(
        &self,
        request: &ApiRequest,
        destination: ChatId,
        source: ChatId,
    ) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.api_url(request.method))
            .json(&request.body)
            .send()
            .await
            .map_err(|e| TransportError::Down {
                transport: TRANSPORT_NAME.into(),
                reason: e.without_url().to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body: ApiErrorBody = resp.json().await.unwrap_or_default();
        let err = classify_failure(status.as_u16(), &body, destination, source);
        tracing::debug!(
            method = request.method,
            status = status.as_u16(),
            error = %err,
            "Telegram call failed"
        );
        Err(err)
    }
}

// ── Transport trait implementation ──────────────────────────────────

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    async fn subscribe(&self) -> Result<MessageStream, TransportError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();
        let poll_timeout = self.poll_timeout_secs;
        let error_backoff = self.poll_error_backoff;

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram transport listening for updates");

            while !tx.is_closed() {
                let body = json!({
                    "offset": offset,
                    "timeout": poll_timeout,
                    "allowed_updates": ["message", "channel_post"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram poll error");
                        tokio::time::sleep(error_backoff).await;
                        continue;
                    }
                };

                let status = resp.status();
                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram parse error");
                        tokio::time::sleep(error_backoff).await;
                        continue;
                    }
                };

                let results = if status.is_success() && data["ok"] == Value::Bool(true) {
                    data.get("result").and_then(Value::as_array)
                } else {
                    None
                };
                let Some(results) = results else {
                    let delay = poll_failure_delay(status.as_u16(), &data, error_backoff);
                    tracing::warn!(
                        status = status.as_u16(),
                        description = data["description"].as_str().unwrap_or_default(),
                        delay_secs = delay.as_secs(),
                        "getUpdates failed"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(message) = parse_update(update) else {
                        continue;
                    };

                    if tx.send(message).is_err() {
                        tracing::info!("Telegram update stream closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(
        &self,
        destination: ChatId,
        message: &InboundMessage,
        sent_parts: &mut usize,
    ) -> Result<(), TransportError> {
        let requests = build_requests(destination, message);
        for request in requests.iter().skip(*sent_parts) {
            self.call(request, destination, message.source).await?;
            *sent_parts += 1;
        }
        Ok(())
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<(), TransportError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let request = ApiRequest {
                method: "sendMessage",
                body: json!({ "chat_id": chat.0, "text": chunk }),
            };
            self.call(&request, chat, chat).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| TransportError::Down {
                transport: TRANSPORT_NAME.into(),
                reason: e.without_url().to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Down {
                transport: TRANSPORT_NAME.into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Build the Bot API calls that resend `message` into `destination`.
pub fn build_requests(destination: ChatId, message: &InboundMessage) -> Vec<ApiRequest> {
    let chat_id = destination.0;
    match &message.content {
        MessageContent::Text { text } => split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH)
            .into_iter()
            .map(|chunk| ApiRequest {
                method: "sendMessage",
                body: json!({ "chat_id": chat_id, "text": chunk }),
            })
            .collect(),
        MessageContent::Photo(media) => vec![media_request("sendPhoto", "photo", chat_id, media)],
        MessageContent::Video(media) => vec![media_request("sendVideo", "video", chat_id, media)],
        MessageContent::Document(media) => {
            vec![media_request("sendDocument", "document", chat_id, media)]
        }
        MessageContent::Audio(media) => vec![media_request("sendAudio", "audio", chat_id, media)],
        MessageContent::Voice(media) => vec![media_request("sendVoice", "voice", chat_id, media)],
        MessageContent::VideoNote { file_id } => vec![ApiRequest {
            method: "sendVideoNote",
            body: json!({ "chat_id": chat_id, "video_note": file_id }),
        }],
        MessageContent::Sticker { file_id } => vec![ApiRequest {
            method: "sendSticker",
            body: json!({ "chat_id": chat_id, "sticker": file_id }),
        }],
        MessageContent::Other => vec![ApiRequest {
            method: "forwardMessage",
            body: json!({
                "chat_id": chat_id,
                "from_chat_id": message.source.0,
                "message_id": message.message_id
            }),
        }],
    }
}

fn media_request(method: &'static str, field: &str, chat_id: i64, media: &MediaRef) -> ApiRequest {
    let mut body = json!({ "chat_id": chat_id });
    body[field] = Value::String(media.file_id.clone());
    body["caption"] = Value::String(media.caption.clone().unwrap_or_default());
    ApiRequest { method, body }
}

/// Map a failed Bot API response onto the transport failure taxonomy.
fn classify_failure(
    status: u16,
    body: &ApiErrorBody,
    destination: ChatId,
    source: ChatId,
) -> TransportError {
    let description = body.description.clone().unwrap_or_default();
    let lowered = description.to_lowercase();

    match status {
        429 => TransportError::RateLimited {
            transport: TRANSPORT_NAME.into(),
            retry_after: Duration::from_secs(
                body.parameters
                    .as_ref()
                    .and_then(|p| p.retry_after)
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            ),
        },
        403 => TransportError::PermissionDenied {
            scope: PermissionScope::Destination,
            chat: destination,
            reason: description,
        },
        400 if lowered.contains("message to forward not found") => {
            TransportError::PermissionDenied {
                scope: PermissionScope::Source,
                chat: source,
                reason: description,
            }
        }
        400 if is_destination_access_error(&lowered) => TransportError::PermissionDenied {
            scope: PermissionScope::Destination,
            chat: destination,
            reason: description,
        },
        401 | 404 | 500..=599 => TransportError::Down {
            transport: TRANSPORT_NAME.into(),
            reason: format!("HTTP {status}: {description}"),
        },
        _ => TransportError::Unknown(format!("HTTP {status}: {description}")),
    }
}

/// How long the poll loop waits after a failed `getUpdates`: the server's
/// `retry_after` on 429, otherwise the fixed poll backoff.
fn poll_failure_delay(status: u16, data: &Value, backoff: Duration) -> Duration {
    if status != 429 {
        return backoff;
    }
    let retry_after = data["parameters"]["retry_after"]
        .as_u64()
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(retry_after)
}

fn is_destination_access_error(description: &str) -> bool {
    [
        "chat not found",
        "not enough rights",
        "have no rights",
        "need administrator rights",
        "chat_write_forbidden",
        "upgraded to a supergroup",
    ]
    .iter()
    .any(|needle| description.contains(needle))
}

/// Parse a `getUpdates` entry into an inbound message.
///
/// Channel posts and group/private messages are both accepted.
fn parse_update(update: &Value) -> Option<InboundMessage> {
    let message = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;

    let source = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let received_at = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        source: ChatId(source),
        message_id,
        content: parse_content(message),
        received_at,
    })
}

fn parse_content(message: &Value) -> MessageContent {
    let caption = message
        .get("caption")
        .and_then(Value::as_str)
        .map(String::from);
    let file_id = |field: &str| {
        message
            .get(field)
            .and_then(|m| m.get("file_id"))
            .and_then(Value::as_str)
            .map(String::from)
    };
    let media = |file_id: String| MediaRef {
        file_id,
        caption: caption.clone(),
    };

    if let Some(text) = message.get("text").and_then(Value::as_str) {
        return MessageContent::Text { text: text.to_string() };
    }

    // Telegram lists photo sizes smallest first.
    if let Some(largest) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|p| p.get("file_id"))
        .and_then(Value::as_str)
    {
        return MessageContent::Photo(media(largest.to_string()));
    }

    if let Some(id) = file_id("video") {
        return MessageContent::Video(media(id));
    }
    if let Some(id) = file_id("document") {
        return MessageContent::Document(media(id));
    }
    if let Some(id) = file_id("audio") {
        return MessageContent::Audio(media(id));
    }
    if let Some(id) = file_id("voice") {
        return MessageContent::Voice(media(id));
    }
    if let Some(id) = file_id("video_note") {
        return MessageContent::VideoNote { file_id: id };
    }
    if let Some(id) = file_id("sticker") {
        return MessageContent::Sticker { file_id: id };
    }

    MessageContent::Other
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let hard_cut = remaining
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let chunk = &remaining[..hard_cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard_cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
