//! SQLite-backed roster
//!
//! Schema:
//!
//! - `roster(row_index, group_email, member_email, start_time, end_time, membership_name)`
//!   holds the declared memberships. Time columns carry no type affinity, so
//!   they may hold text timestamps or integer epoch milliseconds.
//! - `settings(key, value)` holds the maintenance flag (`maintenance_lock`)
//!   and the last change time (`last_operation`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Value};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{ResultSink, RosterSource};
use crate::error::{Result, RosterError};
use crate::lock::{FlagValue, PauseSignal};
use crate::models::{GroupEmail, MemberEmail, MembershipName, RosterRow, SyncResult};
use crate::utils::{parse_timestamp, timestamp_from_millis};

/// Settings key of the maintenance flag
pub const MAINTENANCE_KEY: &str = "maintenance_lock";

/// Settings key of the last change timestamp
pub const LAST_OPERATION_KEY: &str = "last_operation";

/// Roster, settings and pause flag in one SQLite database
pub struct SqliteRosterStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRosterStore {
    /// Open an existing roster database
    ///
    /// # Errors
    ///
    /// Returns `RosterError::NotFound` if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RosterError::NotFound(path.display().to_string()).into());
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create (or open) a roster database and make sure the schema exists
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RosterError::Poisoned.into())
    }

    /// Create tables if they do not exist
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS roster (
                    row_index INTEGER PRIMARY KEY,
                    group_email TEXT,
                    member_email TEXT,
                    start_time,
                    end_time,
                    membership_name TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_roster_group_member
                    ON roster(group_email, member_email);

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value
                );
            "#,
        )?;
        Ok(())
    }

    /// Append a roster row and return its index
    pub fn insert_row<S: ToSql, E: ToSql>(
        &self,
        group: &str,
        member: &str,
        start: S,
        end: E,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO roster (group_email, member_email, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
            params![group, member, start, end],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recorded relationship name of a row
    pub fn membership_name(&self, row_index: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let name: Option<Option<String>> = conn
            .query_row(
                "SELECT membership_name FROM roster WHERE row_index = ?1",
                params![row_index],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    /// Number of rows in the roster table, well-formed or not
    pub fn row_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM roster", [], |row| row.get(0))?)
    }

    fn setting(&self, key: &str) -> Result<Value> {
        let conn = self.conn()?;
        let value: Option<Value> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(Value::Null))
    }

    fn put_setting<V: ToSql>(&self, key: &str, value: V) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
                INSERT INTO settings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Raw maintenance flag value
    pub fn maintenance_value(&self) -> Result<FlagValue> {
        Ok(self.setting(MAINTENANCE_KEY)?.into())
    }

    /// Set or clear the maintenance flag
    pub fn set_maintenance(&self, on: bool) -> Result<()> {
        self.put_setting(MAINTENANCE_KEY, if on { "ON" } else { "OFF" })?;
        info!(maintenance = on, "Maintenance flag updated");
        Ok(())
    }

    /// Time of the last run that changed anything
    pub fn last_operation(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(match self.setting(LAST_OPERATION_KEY)? {
            Value::Text(s) => parse_timestamp(&s),
            Value::Integer(ms) => timestamp_from_millis(ms),
            _ => None,
        })
    }
}

fn text_value(value: Value) -> Option<String> {
    match value {
        Value::Text(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

fn time_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Text(s) => parse_timestamp(s),
        Value::Integer(ms) => timestamp_from_millis(*ms),
        Value::Real(ms) if ms.is_finite() => timestamp_from_millis(*ms as i64),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("{s:?}"),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[async_trait]
impl RosterSource for SqliteRosterStore {
    async fn load(&self) -> Result<Vec<RosterRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT row_index, group_email, member_email, start_time, end_time, membership_name
             FROM roster ORDER BY row_index",
        )?;

        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Value>(1)?,
                    row.get::<_, Value>(2)?,
                    row.get::<_, Value>(3)?,
                    row.get::<_, Value>(4)?,
                    row.get::<_, Value>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (row_index, group, member, start, end, membership) in raw {
            let (Some(group), Some(member)) = (text_value(group), text_value(member)) else {
                debug!(row = row_index, "Skipping row without group or member");
                continue;
            };

            let (Some(valid_from), Some(valid_to)) = (time_value(&start), time_value(&end)) else {
                warn!(
                    row = row_index,
                    start = %describe(&start),
                    end = %describe(&end),
                    "Skipping row with invalid start/end time"
                );
                continue;
            };

            rows.push(RosterRow {
                row_index,
                group: GroupEmail::new(group),
                member: MemberEmail::new(member),
                valid_from,
                valid_to,
                membership_ref: text_value(membership).map(MembershipName::new),
            });
        }

        info!(rows = rows.len(), "Loaded roster rows");
        Ok(rows)
    }
}

#[async_trait]
impl ResultSink for SqliteRosterStore {
    async fn write_results(&self, rows: &[RosterRow], results: &[SyncResult]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;

        {
            let mut update = tx.prepare("UPDATE roster SET membership_name = ?1 WHERE row_index = ?2")?;
            let first_row = |result: &SyncResult, member: &MemberEmail| {
                rows.iter()
                    .find(|r| r.group == result.group && &r.member == member)
                    .map(|r| r.row_index)
            };

            for result in results {
                for member in &result.added {
                    let Some(row_index) = first_row(result, member) else {
                        continue;
                    };
                    let name = result.added_refs.get(member).map(MembershipName::as_str);
                    update.execute(params![name, row_index])?;
                    debug!(row = row_index, member = %member, "Recorded membership name");
                    written += 1;
                }

                for member in &result.removed {
                    let Some(row_index) = first_row(result, member) else {
                        continue;
                    };
                    update.execute(params![Option::<&str>::None, row_index])?;
                    debug!(row = row_index, member = %member, "Cleared membership name");
                    written += 1;
                }
            }
        }

        tx.commit()?;
        if written > 0 {
            info!(rows = written, "Wrote results back to roster");
        }
        Ok(())
    }

    async fn record_last_change(&self, at: DateTime<Utc>) -> Result<()> {
        self.put_setting(LAST_OPERATION_KEY, at.to_rfc3339())?;
        info!(at = %at.to_rfc3339(), "Recorded last change time");
        Ok(())
    }
}

#[async_trait]
impl PauseSignal for SqliteRosterStore {
    async fn is_paused(&self) -> Result<bool> {
        Ok(self.maintenance_value()?.is_set())
    }
}

impl std::fmt::Debug for SqliteRosterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRosterStore")
            .field("path", &self.path)
            .finish()
    }
}
