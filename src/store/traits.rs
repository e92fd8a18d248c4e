//! `TaskStore` trait: single async interface for rule and stats persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::rules::model::{ForwardingRule, RuleStatistics};
use crate::transport::ChatId;

/// Periodic snapshot of relay activity and resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatsRecord {
    pub messages_forwarded: u64,
    pub errors: u64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub queue_size: usize,
    pub active_rules: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Backend-agnostic store for forwarding rules and system stats.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Rules ───────────────────────────────────────────────────────

    /// Insert a rule, or reactivate the existing `(source, destination)`
    /// pair and reset its error count and last error.
    async fn add_rule(
        &self,
        source: ChatId,
        destination: ChatId,
    ) -> Result<ForwardingRule, DatabaseError>;

    /// Get a rule by ID.
    async fn get_rule(&self, id: i64) -> Result<Option<ForwardingRule>, DatabaseError>;

    /// All rules, newest first.
    async fn list_rules(&self) -> Result<Vec<ForwardingRule>, DatabaseError>;

    /// Active rules, ordered by ID.
    async fn list_active(&self) -> Result<Vec<ForwardingRule>, DatabaseError>;

    /// Active rules for one source chat, ordered by ID.
    async fn get_by_source(&self, source: ChatId) -> Result<Vec<ForwardingRule>, DatabaseError>;

    /// Set a rule's active flag. `NotFound` if the rule does not exist.
    async fn set_active(&self, id: i64, active: bool) -> Result<(), DatabaseError>;

    /// Delete a rule. `NotFound` if the rule does not exist.
    async fn delete_rule(&self, id: i64) -> Result<(), DatabaseError>;

    /// Update a rule's counters after a delivery outcome.
    async fn record_stats(
        &self,
        id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Deactivate every active rule. Returns the number changed.
    async fn pause_all(&self) -> Result<usize, DatabaseError>;

    /// Reactivate every inactive rule, clearing error state. Returns the
    /// number changed.
    async fn resume_all(&self) -> Result<usize, DatabaseError>;

    /// Totals across all rules plus the most active one.
    async fn rule_statistics(&self) -> Result<RuleStatistics, DatabaseError>;

    // ── System stats ────────────────────────────────────────────────

    /// Persist a system stats snapshot.
    async fn log_system_stats(&self, record: &SystemStatsRecord) -> Result<(), DatabaseError>;

    /// Snapshots recorded since `since`, newest first.
    async fn system_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemStatsRecord>, DatabaseError>;

    /// Delete snapshots older than `keep_days`. Returns the number deleted.
    async fn cleanup_old_stats(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Cheap liveness query.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Stop serving requests. Later calls fail with `DatabaseError::Closed`.
    async fn close(&self);
}
