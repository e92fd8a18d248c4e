//! Schema migrations for the relay store.
//!
//! Applied versions are recorded in `_migrations`. Each pending step runs in
//! its own transaction together with its version row, so a failed step
//! leaves the schema at the previous version.

use chrono::Utc;
use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema history. Only ever append.
const STEPS: &[Step] = &[Step {
    version: 1,
    name: "rules_and_system_stats",
    sql: r#"
            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                destination_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                messages_forwarded INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_message_at TEXT,
                UNIQUE(source_id, destination_id)
            );
            CREATE INDEX IF NOT EXISTS idx_rules_source_id ON rules(source_id);
            CREATE INDEX IF NOT EXISTS idx_rules_destination_id ON rules(destination_id);
            CREATE INDEX IF NOT EXISTS idx_rules_is_active ON rules(is_active);

            CREATE TABLE IF NOT EXISTS system_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                messages_forwarded INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                memory_mb REAL NOT NULL DEFAULT 0.0,
                cpu_percent REAL NOT NULL DEFAULT 0.0,
                queue_size INTEGER NOT NULL DEFAULT 0,
                active_rules INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_system_stats_recorded_at ON system_stats(recorded_at);
    "#,
}];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

fn failed(what: impl std::fmt::Display, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{what}: {e}"))
}

/// Bring the schema up to date. Returns how many steps were applied.
pub async fn run_migrations(conn: &Connection) -> Result<usize, DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| failed("create _migrations", e))?;

    let from = schema_version(conn).await?;
    let mut applied = 0;
    for step in STEPS.iter().filter(|s| s.version > from) {
        apply(conn, step).await?;
        applied += 1;
    }

    if applied > 0 {
        info!(from, to = schema_version(conn).await?, applied, "Store schema migrated");
    }
    Ok(applied)
}

async fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    debug!(version = step.version, name = step.name, "Applying migration");
    let label = format!("V{} {}", step.version, step.name);

    let tx = conn
        .transaction()
        .await
        .map_err(|e| failed(&label, e))?;
    tx.execute_batch(step.sql)
        .await
        .map_err(|e| failed(&label, e))?;
    tx.execute(
        "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        libsql::params![step.version, step.name, Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| failed(&label, e))?;
    tx.commit().await.map_err(|e| failed(&label, e))
}

/// Highest applied version; 0 for a fresh database.
pub async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| failed("read schema version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| failed("read schema version", e))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| failed("read schema version", e))
}
