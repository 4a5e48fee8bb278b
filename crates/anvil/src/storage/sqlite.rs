// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite backend
//!
//! Local storage for development and tests. Unlike the PostgreSQL
//! backend it creates its tables on open.
//!
//! Thread-safe via internal Mutex (SQLite Connection is not Sync).

use super::{BatchSink, SinkError};
use crate::config::PayloadFormat;
use crate::model::{RawMessage, Reading};
use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{params, Connection, ErrorCode};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a write waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite store for both record types.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE raw_messages (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     timestamp TEXT NOT NULL,
///     topic TEXT NOT NULL,
///     payload BLOB NOT NULL
/// );
/// CREATE TABLE telemetry (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     timestamp TEXT NOT NULL,
///     device_id TEXT NOT NULL,
///     sensor_name TEXT NOT NULL,
///     value REAL NOT NULL,
///     topic TEXT NOT NULL
/// );
/// ```
pub struct SqliteSink {
    conn: Mutex<Connection>,
    raw_table: String,
    readings_table: String,
    payload_format: PayloadFormat,
}

impl SqliteSink {
    /// Open (or create) a file-based database.
    pub fn open(path: &str, raw_table: &str, readings_table: &str) -> Result<Self, SinkError> {
        let conn = Connection::open(path).map_err(|e| {
            SinkError::permanent(format!("failed to open SQLite database at {}: {}", path, e))
        })?;
        // Sinks sharing a file wait for each other's write locks.
        conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| classify(&e))?;
        Self::with_connection(conn, raw_table, readings_table)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory(raw_table: &str, readings_table: &str) -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory().map_err(|e| classify(&e))?;
        Self::with_connection(conn, raw_table, readings_table)
    }

    /// Store payloads as text instead of blobs.
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    fn with_connection(
        conn: Connection,
        raw_table: &str,
        readings_table: &str,
    ) -> Result<Self, SinkError> {
        let sink = Self {
            conn: Mutex::new(conn),
            raw_table: raw_table.to_string(),
            readings_table: readings_table.to_string(),
            payload_format: PayloadFormat::Bytea,
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> Result<(), SinkError> {
        let conn = self.lock();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {raw} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{raw}_timestamp ON {raw}(timestamp);
            CREATE TABLE IF NOT EXISTS {readings} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                device_id TEXT NOT NULL,
                sensor_name TEXT NOT NULL,
                value REAL NOT NULL,
                topic TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{readings}_device ON {readings}(device_id, timestamp);",
            raw = self.raw_table,
            readings = self.readings_table,
        ))
        .map_err(|e| SinkError::permanent(format!("failed to create schema: {}", e)))
    }

    /// Number of archived raw messages.
    pub fn raw_count(&self) -> Result<usize, SinkError> {
        self.count(&self.raw_table)
    }

    /// Number of stored readings.
    pub fn reading_count(&self) -> Result<usize, SinkError> {
        self.count(&self.readings_table)
    }

    /// Stored readings in insertion order.
    pub fn load_readings(&self) -> Result<Vec<Reading>, SinkError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT timestamp, device_id, sensor_name, value, topic FROM {} ORDER BY id ASC",
                self.readings_table
            ))
            .map_err(|e| classify(&e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| classify(&e))?;

        let mut readings = Vec::new();
        for row in rows {
            let (ts, device_id, sensor_name, value, topic) = row.map_err(|e| classify(&e))?;
            let timestamp = chrono::DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| SinkError::permanent(format!("bad timestamp '{}': {}", ts, e)))?
                .with_timezone(&chrono::Utc);
            readings.push(Reading {
                timestamp,
                device_id,
                sensor_name,
                value,
                topic,
            });
        }
        Ok(readings)
    }

    fn count(&self, table: &str) -> Result<usize, SinkError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(|e| classify(&e))?;
        Ok(count as usize)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BatchSink<RawMessage> for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write_batch(&self, items: &[RawMessage]) -> Result<(), SinkError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| classify(&e))?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO {} (timestamp, topic, payload) VALUES (?1, ?2, ?3)",
                    self.raw_table
                ))
                .map_err(|e| classify(&e))?;
            for msg in items {
                let ts = msg.received_at.to_rfc3339_opts(SecondsFormat::Micros, true);
                let result = match self.payload_format {
                    PayloadFormat::Text => stmt.execute(params![ts, msg.topic, msg.payload_text()]),
                    PayloadFormat::Bytea => stmt.execute(params![ts, msg.topic, msg.payload]),
                };
                result.map_err(|e| classify(&e))?;
            }
        }
        tx.commit().map_err(|e| classify(&e))
    }
}

#[async_trait]
impl BatchSink<Reading> for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write_batch(&self, items: &[Reading]) -> Result<(), SinkError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| classify(&e))?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO {} (timestamp, device_id, sensor_name, value, topic)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.readings_table
                ))
                .map_err(|e| classify(&e))?;
            for r in items {
                stmt.execute(params![
                    r.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    r.device_id,
                    r.sensor_name,
                    r.value,
                    r.topic,
                ])
                .map_err(|e| classify(&e))?;
            }
        }
        tx.commit().map_err(|e| classify(&e))
    }
}

/// Busy/locked databases and I/O hiccups are retried; everything else
/// (constraint, schema, misuse) is permanent.
fn classify(err: &rusqlite::Error) -> SinkError {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ) =>
        {
            SinkError::transient(err.to_string())
        }
        _ => SinkError::permanent(err.to_string()),
    }
}
