//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const TARGET_COLUMNS: &str =
    "id, name, address, probe_kind, principal, secret, is_server, branch_id, is_active";
const HISTORY_COLUMNS: &str = "id, target_id, is_alive, response_time, packet_loss, min_time, max_time, avg_time, error_message, checked_at";

/// Largest page of history a caller may request.
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target registry ---

    /// Add a new target and return its ID. The secret must already be encrypted.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO targets (name, address, probe_kind, principal, secret, is_server, branch_id, is_active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                target.name,
                target.address,
                target.probe_kind,
                target.principal,
                target.secret,
                target.is_server,
                target.branch_id,
                target.is_active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Update an existing target, including its stored secret.
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE targets SET name=?1, address=?2, probe_kind=?3, principal=?4, secret=?5, is_server=?6, branch_id=?7, is_active=?8 WHERE id=?9",
            params![
                target.name,
                target.address,
                target.probe_kind,
                target.principal,
                target.secret,
                target.is_server,
                target.branch_id,
                target.is_active,
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// List targets matching the filter, ordered by name.
    pub fn list_targets(&self, filter: &TargetFilter) -> Result<Vec<Target>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets
             WHERE (?1 IS NULL OR branch_id = ?1)
               AND (?2 IS NULL OR probe_kind = ?2)
               AND (?3 OR is_active = 1)
             ORDER BY name ASC, id ASC"
        ))?;

        let targets = stmt
            .query_map(
                params![filter.branch_id, filter.kind, filter.include_inactive],
                target_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a target and its history.
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM history WHERE target_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        if removed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- History log ---

    /// Append one history row and return its ID. Rows are never updated.
    pub fn append_history(&self, record: &HistoryRecord) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO history (target_id, is_alive, response_time, packet_loss, min_time, max_time, avg_time, error_message, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.target_id,
                record.is_alive,
                record.response_time,
                record.packet_loss,
                record.min_time,
                record.max_time,
                record.avg_time,
                record.error_message,
                record.checked_at.format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest-first history of a target, at most `limit` rows.
    pub fn query_history(&self, target_id: i64, limit: u32) -> Result<Vec<HistoryRecord>, DbError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history WHERE target_id = ?1
             ORDER BY checked_at DESC, id DESC LIMIT ?2"
        ))?;

        let rows = stmt
            .query_map(params![target_id, limit], history_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Most recent check of each given target. Targets never checked are absent.
    pub fn latest_history(&self, target_ids: &[i64]) -> Result<HashMap<i64, HistoryRecord>, DbError> {
        if target_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; target_ids.len()].join(", ");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history h
             WHERE h.target_id IN ({placeholders})
               AND h.id = (SELECT id FROM history
                           WHERE target_id = h.target_id
                           ORDER BY checked_at DESC, id DESC LIMIT 1)"
        ))?;

        let latest = stmt
            .query_map(params_from_iter(target_ids), history_from_row)?
            .map(|row| row.map(|r| (r.target_id, r)))
            .collect::<SqlResult<HashMap<_, _>>>()?;

        Ok(latest)
    }
}

fn history_from_row(row: &Row<'_>) -> SqlResult<HistoryRecord> {
    let time_str: String = row.get(9)?;
    Ok(HistoryRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        is_alive: row.get(2)?,
        response_time: row.get(3)?,
        packet_loss: row.get(4)?,
        min_time: row.get(5)?,
        max_time: row.get(6)?,
        avg_time: row.get(7)?,
        error_message: row.get(8)?,
        checked_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
    })
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        probe_kind: row.get(3)?,
        principal: row.get(4)?,
        secret: row.get(5)?,
        is_server: row.get(6)?,
        branch_id: row.get(7)?,
        is_active: row.get(8)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
