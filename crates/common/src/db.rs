//! SQLite database for revert targets and their event history

use crate::types::{RevertEvent, RevertOutcome, RevertTarget};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const TARGET_COLUMNS: &str =
    "id, name, vm_name, snapshot_name, last_revert_at, created_at, updated_at";

const EVENT_COLUMNS: &str =
    "id, target_id, action, vm_name, snapshot_name, outcome, message, created_at";

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                vm_name TEXT NOT NULL,
                snapshot_name TEXT,
                last_revert_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_targets_name ON targets(name);

            CREATE TABLE IF NOT EXISTS revert_events (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                action TEXT NOT NULL,
                vm_name TEXT NOT NULL,
                snapshot_name TEXT,
                outcome TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_revert_events_target
                ON revert_events(target_id, created_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Targets
    // ========================================================================

    /// Insert a new target. Names are unique.
    pub fn insert_target(&self, target: &RevertTarget) -> Result<()> {
        let conn = self.conn.lock();

        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE name = ?1 OR id = ?2",
            params![target.name, target.id],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Error::AlreadyExists {
                kind: "target".to_string(),
                name: target.name.clone(),
            });
        }

        conn.execute(
            &format!(
                "INSERT INTO targets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                TARGET_COLUMNS
            ),
            params![
                target.id,
                target.name,
                target.vm_name,
                target.snapshot_name,
                target.last_revert_at.map(|t| t.timestamp()),
                target.created_at,
                target.updated_at,
            ],
        )?;

        debug!("Inserted target {} ({})", target.name, target.id);
        Ok(())
    }

    /// Get a target by id, falling back to name
    pub fn get_target(&self, id_or_name: &str) -> Result<Option<RevertTarget>> {
        let conn = self.conn.lock();

        let target = conn
            .query_row(
                &format!(
                    "SELECT {} FROM targets WHERE id = ?1 OR name = ?1
                     ORDER BY (id = ?1) DESC LIMIT 1",
                    TARGET_COLUMNS
                ),
                params![id_or_name],
                target_from_row,
            )
            .optional()?;

        Ok(target)
    }

    /// List all targets, by name
    pub fn list_targets(&self) -> Result<Vec<RevertTarget>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets ORDER BY name ASC",
            TARGET_COLUMNS
        ))?;

        let rows = stmt.query_map([], target_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }

    /// Update a target's mutable fields. Returns false if it does not exist.
    pub fn update_target(&self, target: &RevertTarget) -> Result<bool> {
        let conn = self.conn.lock();

        let clash: i64 = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE name = ?1 AND id != ?2",
            params![target.name, target.id],
            |row| row.get(0),
        )?;
        if clash > 0 {
            return Err(Error::AlreadyExists {
                kind: "target".to_string(),
                name: target.name.clone(),
            });
        }

        let now = Utc::now().timestamp();
        let rows = conn.execute(
            "UPDATE targets SET name = ?2, vm_name = ?3, snapshot_name = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                target.id,
                target.name,
                target.vm_name,
                target.snapshot_name,
                now
            ],
        )?;

        Ok(rows > 0)
    }

    /// Delete a target and its history
    pub fn delete_target(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();

        conn.execute(
            "DELETE FROM revert_events WHERE target_id = ?1",
            params![id],
        )?;
        let rows = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted target with id {}", id);
        }

        Ok(rows > 0)
    }

    /// Stamp a successful revert on a target
    pub fn record_revert(&self, target_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE targets SET last_revert_at = ?2 WHERE id = ?1",
            params![target_id, at.timestamp()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Append an event to a target's history
    pub fn record_event(&self, event: &RevertEvent) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            &format!(
                "INSERT INTO revert_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                EVENT_COLUMNS
            ),
            params![
                event.id,
                event.target_id,
                event.action,
                event.vm_name,
                event.snapshot_name,
                event.outcome.to_string(),
                event.message,
                event.created_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    /// Most recent events for a target, newest first
    pub fn list_events(&self, target_id: &str, limit: usize) -> Result<Vec<RevertEvent>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM revert_events WHERE target_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;

        // SQLite reads a negative LIMIT as unbounded
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![target_id, limit], event_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<RevertTarget> {
    let last_revert_at: Option<i64> = row.get(4)?;
    Ok(RevertTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        vm_name: row.get(2)?,
        snapshot_name: row.get(3)?,
        last_revert_at: last_revert_at.map(timestamp),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<RevertEvent> {
    let outcome: String = row.get(5)?;
    let outcome = outcome.parse::<RevertOutcome>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(Error::Internal(e)),
        )
    })?;

    Ok(RevertEvent {
        id: row.get(0)?,
        target_id: row.get(1)?,
        action: row.get(2)?,
        vm_name: row.get(3)?,
        snapshot_name: row.get(4)?,
        outcome,
        message: row.get(6)?,
        created_at: timestamp(row.get(7)?),
    })
}
