//! Durable event index.
//!
//! The gateway treats the store as an external collaborator behind the
//! [`EventStore`] trait; the embedded SQLite implementation below is
//! what ships. One append-only table, opened at startup. A pre-existing
//! table whose columns no longer match is renamed aside rather than
//! migrated: event data on disk is the ground truth, the index is
//! rebuildable.

use std::path::Path;

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("event store error: {0}")]
  Sqlite(#[from] rusqlite::Error),
}

/// One row per completed event. Append-only.
#[derive(Debug, Clone)]
pub struct EventRow {
  pub event_id: String,
  pub start_time: DateTime<Utc>,
  pub end_time: DateTime<Utc>,
  pub duration_s: f64,
  pub trigger_device: u16,
  pub max_acceleration_g: f64,
  pub num_devices: usize,
  pub data_path: String,
  pub created_at: DateTime<Utc>,
}

pub trait EventStore: Send {
  fn insert_event(&mut self, row: &EventRow) -> Result<(), StoreError>;
}

const EXPECTED_COLUMNS: [&str; 9] = [
  "event_id",
  "start_time",
  "end_time",
  "duration",
  "trigger_device",
  "max_acceleration",
  "num_devices",
  "data_path",
  "created_at",
];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    start_time REAL,
    end_time REAL,
    duration REAL,
    trigger_device INTEGER,
    max_acceleration REAL,
    num_devices INTEGER,
    data_path TEXT,
    created_at TEXT
  )";

pub struct SqliteStore {
  conn: Connection,
}

impl SqliteStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let conn = Connection::open(path.as_ref())?;
    let mut store = SqliteStore { conn };
    store.ensure_schema()?;
    info!("event store opened: {}", path.as_ref().display());
    Ok(store)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()?;
    let mut store = SqliteStore { conn };
    store.ensure_schema()?;
    Ok(store)
  }

  fn ensure_schema(&mut self) -> Result<(), StoreError> {
    let columns = self.existing_columns()?;
    if !columns.is_empty() && columns != EXPECTED_COLUMNS {
      let backup = format!("events_mismatch_{}", Utc::now().format("%Y%m%d_%H%M%S"));
      warn!(
        "events table schema mismatch ({} columns); renaming to {}",
        columns.len(),
        backup
      );
      self
        .conn
        .execute(&format!("ALTER TABLE events RENAME TO {backup}"), [])?;
    }
    self.conn.execute(CREATE_TABLE, [])?;
    Ok(())
  }

  fn existing_columns(&self) -> Result<Vec<String>, StoreError> {
    let mut stmt = self.conn.prepare("PRAGMA table_info(events)")?;
    let columns = stmt
      .query_map([], |row| row.get::<_, String>(1))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
  }

  pub fn event_count(&self) -> Result<u64, StoreError> {
    let count: i64 = self
      .conn
      .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count as u64)
  }
}

impl EventStore for SqliteStore {
  fn insert_event(&mut self, row: &EventRow) -> Result<(), StoreError> {
    self.conn.execute(
      "INSERT INTO events VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
      rusqlite::params![
        row.event_id,
        row.start_time.timestamp_millis() as f64 / 1000.0,
        row.end_time.timestamp_millis() as f64 / 1000.0,
        row.duration_s,
        row.trigger_device,
        row.max_acceleration_g,
        row.num_devices as i64,
        row.data_path,
        row.created_at.to_rfc3339(),
      ],
    )?;
    Ok(())
  }
}
