//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Booleans are stored as
//! INTEGER 0/1 and timestamps as RFC 3339 text in UTC, which keeps them
//! lexicographically ordered for range deletes.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::rules::model::{ForwardingRule, RuleStatistics};
use crate::store::migrations;
use crate::store::traits::{SystemStatsRecord, TaskStore};
use crate::transport::ChatId;

const RULE_COLUMNS: &str = "id, source_id, destination_id, is_active, messages_forwarded, \
                            error_count, last_error, created_at, updated_at, last_message_at";

const STATS_COLUMNS: &str = "recorded_at, messages_forwarded, errors, memory_mb, cpu_percent, \
                             queue_size, active_rules";

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    closed: AtomicBool,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the connection, unless the store has been closed.
    fn conn(&self) -> Result<&Connection, DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        Ok(&self.conn)
    }

    async fn query_rules(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
        op: &str,
    ) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn()?
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            rules.push(
                row_to_rule(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
            );
        }
        Ok(rules)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for writes.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_rule(row: &Row) -> Result<ForwardingRule, libsql::Error> {
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    let last_message: Option<String> = row.get(9).ok();

    Ok(ForwardingRule {
        id: row.get(0)?,
        source: ChatId(row.get(1)?),
        destination: ChatId(row.get(2)?),
        active: row.get::<i64>(3)? != 0,
        messages_forwarded: row.get(4)?,
        error_count: row.get(5)?,
        last_error: row.get(6).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        last_message_at: last_message.as_deref().map(parse_datetime),
    })
}

fn row_to_stats(row: &Row) -> Result<SystemStatsRecord, libsql::Error> {
    let recorded: String = row.get(0)?;
    Ok(SystemStatsRecord {
        recorded_at: parse_datetime(&recorded),
        messages_forwarded: row.get::<i64>(1)?.max(0) as u64,
        errors: row.get::<i64>(2)?.max(0) as u64,
        memory_mb: row.get(3)?,
        cpu_percent: row.get(4)?,
        queue_size: row.get::<i64>(5)?.max(0) as usize,
        active_rules: row.get::<i64>(6)?.max(0) as usize,
    })
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn add_rule(
        &self,
        source: ChatId,
        destination: ChatId,
    ) -> Result<ForwardingRule, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let mut rows = self
            .conn()?
            .query(
                "INSERT INTO rules (source_id, destination_id, is_active, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?3)
                 ON CONFLICT (source_id, destination_id) DO UPDATE SET
                     is_active = 1,
                     error_count = 0,
                     last_error = NULL,
                     updated_at = ?3
                 RETURNING id",
                params![source.0, destination.0, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_rule: {e}")))?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("add_rule row parse: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("add_rule: no id returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("add_rule: {e}"))),
        };

        info!(rule_id = id, %source, %destination, "Rule added");

        self.get_rule(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })
    }

    async fn get_rule(&self, id: i64) -> Result<Option<ForwardingRule>, DatabaseError> {
        let rules = self
            .query_rules(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
                "get_rule",
            )
            .await?;
        Ok(rules.into_iter().next())
    }

    async fn list_rules(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
        self.query_rules(
            &format!("SELECT {RULE_COLUMNS} FROM rules ORDER BY id DESC"),
            (),
            "list_rules",
        )
        .await
    }

    async fn list_active(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
        self.query_rules(
            &format!("SELECT {RULE_COLUMNS} FROM rules WHERE is_active = 1 ORDER BY id"),
            (),
            "list_active",
        )
        .await
    }

    async fn get_by_source(&self, source: ChatId) -> Result<Vec<ForwardingRule>, DatabaseError> {
        self.query_rules(
            &format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE source_id = ?1 AND is_active = 1 ORDER BY id"
            ),
            params![source.0],
            "get_by_source",
        )
        .await
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let affected = self
            .conn()?
            .execute(
                "UPDATE rules SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(active), now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_active: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }

        debug!(rule_id = id, active, "Rule active flag updated");
        Ok(())
    }

    async fn delete_rule(&self, id: i64) -> Result<(), DatabaseError> {
        let affected = self
            .conn()?
            .execute("DELETE FROM rules WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }

        info!(rule_id = id, "Rule deleted");
        Ok(())
    }

    async fn record_stats(
        &self,
        id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let now = fmt_datetime(Utc::now());

        // A rule deleted while a delivery was in flight is not an error.
        let result = if success {
            conn.execute(
                "UPDATE rules SET messages_forwarded = messages_forwarded + 1,
                     last_message_at = ?1, updated_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )
            .await
        } else {
            conn.execute(
                "UPDATE rules SET error_count = error_count + 1,
                     last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error.map(str::to_string), now, id],
            )
            .await
        };
        result.map_err(|e| DatabaseError::Query(format!("record_stats: {e}")))?;

        Ok(())
    }

    async fn pause_all(&self) -> Result<usize, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let affected = self
            .conn()?
            .execute(
                "UPDATE rules SET is_active = 0, updated_at = ?1 WHERE is_active = 1",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pause_all: {e}")))?;

        info!(count = affected, "Paused all rules");
        Ok(affected as usize)
    }

    async fn resume_all(&self) -> Result<usize, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let affected = self
            .conn()?
            .execute(
                "UPDATE rules SET is_active = 1, error_count = 0, last_error = NULL,
                     updated_at = ?1
                 WHERE is_active = 0",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resume_all: {e}")))?;

        info!(count = affected, "Resumed all rules");
        Ok(affected as usize)
    }

    async fn rule_statistics(&self) -> Result<RuleStatistics, DatabaseError> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT COUNT(*), COALESCE(SUM(is_active), 0),
                        COALESCE(SUM(messages_forwarded), 0), COALESCE(SUM(error_count), 0)
                 FROM rules",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("rule_statistics: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("rule_statistics: {e}")))?
            .ok_or_else(|| DatabaseError::Query("rule_statistics: no row".into()))?;

        let parse = |e: libsql::Error| DatabaseError::Query(format!("rule_statistics row parse: {e}"));
        let total = row.get::<i64>(0).map_err(parse)?.max(0) as usize;
        let active = row.get::<i64>(1).map_err(parse)?.max(0) as usize;
        let total_forwarded = row.get::<i64>(2).map_err(parse)?;
        let total_errors = row.get::<i64>(3).map_err(parse)?;

        let most_active = self
            .query_rules(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE messages_forwarded > 0
                     ORDER BY messages_forwarded DESC, id LIMIT 1"
                ),
                (),
                "rule_statistics",
            )
            .await?
            .into_iter()
            .next();

        Ok(RuleStatistics {
            total_rules: total,
            active_rules: active,
            inactive_rules: total.saturating_sub(active),
            total_forwarded,
            total_errors,
            most_active,
        })
    }

    async fn log_system_stats(&self, record: &SystemStatsRecord) -> Result<(), DatabaseError> {
        self.conn()?
            .execute(
                &format!("INSERT INTO system_stats ({STATS_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    fmt_datetime(record.recorded_at),
                    record.messages_forwarded as i64,
                    record.errors as i64,
                    record.memory_mb,
                    record.cpu_percent,
                    record.queue_size as i64,
                    record.active_rules as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_system_stats: {e}")))?;
        Ok(())
    }

    async fn system_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemStatsRecord>, DatabaseError> {
        let mut rows = self
            .conn()?
            .query(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM system_stats WHERE recorded_at >= ?1
                     ORDER BY recorded_at DESC"
                ),
                params![fmt_datetime(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("system_stats_since: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("system_stats_since: {e}")))?
        {
            records.push(row_to_stats(&row).map_err(|e| {
                DatabaseError::Query(format!("system_stats_since row parse: {e}"))
            })?);
        }
        Ok(records)
    }

    async fn cleanup_old_stats(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
        let affected = self
            .conn()?
            .execute(
                "DELETE FROM system_stats WHERE recorded_at < ?1",
                params![fmt_datetime(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_old_stats: {e}")))?;

        if affected > 0 {
            info!(count = affected, "Cleaned up old stat records");
        }
        Ok(affected as usize)
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()?
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Task store closed");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
