//! Messaging transport abstraction.
//!
//! The relay never speaks a wire protocol directly. It subscribes to an
//! inbound stream and asks the transport to resend a message, receiving a
//! classified `TransportError` on failure.

pub mod message;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use message::{ChatId, InboundMessage, MediaRef, MessageContent};
pub use telegram::TelegramTransport;

use crate::error::TransportError;

/// Stream of inbound messages from monitored chats.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// External messaging transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Start receiving inbound messages.
    async fn subscribe(&self) -> Result<MessageStream, TransportError>;

    /// Resend `message` into `destination`, dispatching on its content kind.
    ///
    /// A message may take several API calls (long text is split). The first
    /// `*sent_parts` calls are skipped and the counter is bumped after each
    /// one that succeeds, so a retry with the same counter resumes at the
    /// part that failed.
    async fn send(
        &self,
        destination: ChatId,
        message: &InboundMessage,
        sent_parts: &mut usize,
    ) -> Result<(), TransportError>;

    /// Send a plain text message (operator alerts).
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<(), TransportError>;

    /// Check that the transport session is usable.
    async fn health_check(&self) -> Result<(), TransportError>;
}
