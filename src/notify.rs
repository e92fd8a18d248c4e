//! Operator notifications: out-of-band alerts for overflow, rule
//! disablement, resource pressure and lifecycle events.
//!
//! Alerts are fire-and-forget: a failed notification is logged and never
//! propagated to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::rules::ForwardingRule;
use crate::transport::{ChatId, Transport};

/// Delivery channel for human-readable operator alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), TransportError>;
}

/// Sends alerts as text messages to an admin chat.
pub struct TransportNotifier {
    transport: Arc<dyn Transport>,
    chat: ChatId,
}

impl TransportNotifier {
    pub fn new(transport: Arc<dyn Transport>, chat: ChatId) -> Self {
        Self { transport, chat }
    }
}

#[async_trait]
impl Notifier for TransportNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        self.transport.send_text(self.chat, text).await
    }
}

/// Writes alerts to the log. Used when no admin chat is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        info!(alert = text, "Operator alert");
        Ok(())
    }
}

/// Formats and dispatches operator alerts without blocking the caller.
#[derive(Clone)]
pub struct OperatorAlerts {
    notifier: Arc<dyn Notifier>,
}

impl OperatorAlerts {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Dispatch `text` in a background task.
    pub fn send(&self, text: impl Into<String>) {
        let notifier = self.notifier.clone();
        let text = text.into();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&text).await {
                warn!(error = %e, "Failed to deliver operator alert");
            }
        });
    }

    /// Deliver `text` and wait for the outcome. Used right before the
    /// process exits, when a spawned task might never run.
    pub async fn send_now(&self, text: &str) {
        if let Err(e) = self.notifier.notify(text).await {
            warn!(error = %e, "Failed to deliver operator alert");
        }
    }

    pub fn started(&self, rules: usize, workers: usize) {
        self.send(format!(
            "✅ Relay started: {rules} active rules, {workers} workers"
        ));
    }

    pub fn queue_overflow(&self, capacity: usize) {
        self.send(format!(
            "⚠️ Forwarding queue full ({capacity} items). New messages are being dropped."
        ));
    }

    pub fn rule_disabled(&self, rule: &ForwardingRule, reason: &str) {
        self.send(format!(
            "🚫 Rule #{} ({}) disabled: {reason}",
            rule.id,
            rule.route()
        ));
    }

    pub fn resource_warning(&self, summary: &str) {
        self.send(format!(
            "⚠️ Resource warning: {summary}. Ingestion paused briefly."
        ));
    }

    pub async fn critical_restart(&self, summary: &str) {
        self.send_now(&format!(
            "🔴 Resource critical: {summary}. Draining queue and restarting."
        ))
        .await;
    }

    pub async fn shutting_down(&self) {
        self.send_now("🛑 Relay shutting down").await;
    }
}
