//! Forwarding rule data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::ChatId;

/// A persistent source → destination forwarding rule.
///
/// The `(source, destination)` pair is unique in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: i64,
    pub source: ChatId,
    pub destination: ChatId,
    pub active: bool,
    /// Successful deliveries over the rule's lifetime.
    pub messages_forwarded: i64,
    /// Failed deliveries since the rule was last (re)added or resumed.
    pub error_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ForwardingRule {
    /// Short `source → destination` label for logs and alerts.
    pub fn route(&self) -> String {
        format!("{} → {}", self.source, self.destination)
    }
}

/// Aggregate counters over every stored rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStatistics {
    pub total_rules: usize,
    pub active_rules: usize,
    pub inactive_rules: usize,
    pub total_forwarded: i64,
    pub total_errors: i64,
    /// Rule with the most forwarded messages, if any has forwarded at all.
    pub most_active: Option<ForwardingRule>,
}
