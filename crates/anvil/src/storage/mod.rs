// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Storage backends
//!
//! A sink writes one batch at a time, all-or-nothing. Failures are split
//! into transient (retry the same batch) and permanent (retrying cannot
//! help; the sink is suspended until a probe succeeds).
//!
//! # Implementations
//!
//! - `PostgresSink` -- PostgreSQL / TimescaleDB, one connection per sink
//! - `SqliteSink` -- local file, schema created on open
//! - `MockSink` -- in-memory, scripted failures (tests and dry runs)

mod mock;
mod postgres;
mod sqlite;

pub use mock::MockSink;
pub use postgres::{is_transient_sqlstate, PostgresSink, RawColumns, ReadingColumns, RowEncoder};
pub use sqlite::SqliteSink;

use crate::config::{StorageBackend, StorageConfig};
use crate::model::{RawMessage, Reading};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Why a batch write failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Connection loss, timeout, lock contention: retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Constraint, schema or type errors: retrying the same batch cannot succeed.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Destination for batches of one record type.
///
/// `write_batch` must be atomic: either every item is durable when it
/// returns `Ok`, or none is. Items are never reordered or altered.
#[async_trait]
pub trait BatchSink<T: Sync>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Durably write all items in one unit.
    async fn write_batch(&self, items: &[T]) -> Result<(), SinkError>;
}

/// The archive and readings sinks used by the bridge.
#[derive(Clone)]
pub struct Sinks {
    pub raw: Arc<dyn BatchSink<RawMessage>>,
    pub readings: Arc<dyn BatchSink<Reading>>,
}

/// Open both sinks for the configured backend.
///
/// PostgreSQL sinks connect lazily on their first write, so a database
/// that is down at startup only delays the first flush.
pub fn open_sinks(config: &StorageConfig) -> Result<Sinks, SinkError> {
    match config.backend {
        StorageBackend::Postgres => {
            let raw = PostgresSink::raw_archive(config)?;
            let readings = PostgresSink::readings(config)?;
            Ok(Sinks {
                raw: Arc::new(raw),
                readings: Arc::new(readings),
            })
        }
        StorageBackend::Sqlite => {
            // One connection per sink on the same file.
            let open = || {
                SqliteSink::open(
                    &config.sqlite_path,
                    &config.raw_table,
                    &config.readings_table,
                )
                .map(|sink| sink.with_payload_format(config.payload_format))
            };
            Ok(Sinks {
                raw: Arc::new(open()?),
                readings: Arc::new(open()?),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_kinds() {
        let err = SinkError::transient("timeout");
        assert!(!err.is_permanent());
        assert_eq!(err.to_string(), "transient: timeout");

        let err = SinkError::permanent("undefined table");
        assert!(err.is_permanent());
    }

    #[test]
    fn test_open_sqlite_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            sqlite_path: dir.path().join("anvil.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        let sinks = open_sinks(&config).unwrap();
        assert_eq!(sinks.raw.name(), "sqlite");
        assert_eq!(sinks.readings.name(), "sqlite");
    }

    #[tokio::test]
    async fn test_sqlite_sinks_use_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anvil.db").to_string_lossy().into_owned();
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            sqlite_path: path.clone(),
            ..StorageConfig::default()
        };
        let sinks = open_sinks(&config).unwrap();
        assert_ne!(
            Arc::as_ptr(&sinks.raw) as *const (),
            Arc::as_ptr(&sinks.readings) as *const ()
        );

        let now = chrono::Utc::now();
        let raw = RawMessage::new(now, "devices/tank1/telemetry", b"{\"ph\": 7}".to_vec());
        let reading = Reading {
            timestamp: now,
            device_id: "tank1".into(),
            sensor_name: "ph".into(),
            value: 7.0,
            topic: "devices/tank1/telemetry".into(),
        };
        sinks.raw.write_batch(&[raw]).await.unwrap();
        sinks.readings.write_batch(&[reading]).await.unwrap();

        let check = SqliteSink::open(&path, "raw_messages", "telemetry").unwrap();
        assert_eq!(check.raw_count().unwrap(), 1);
        assert_eq!(check.reading_count().unwrap(), 1);
    }

    #[test]
    fn test_open_postgres_sinks_is_lazy() {
        let config = StorageConfig {
            url: "postgresql://nobody@127.0.0.1:1/none".to_string(),
            ..StorageConfig::default()
        };
        let sinks = open_sinks(&config).unwrap();
        assert_eq!(sinks.raw.name(), "raw_messages");
        assert_eq!(sinks.readings.name(), "telemetry");
    }

    #[test]
    fn test_open_postgres_rejects_bad_url() {
        let config = StorageConfig {
            url: "postgresql://localhost:notaport/metrics".to_string(),
            ..StorageConfig::default()
        };
        assert!(matches!(open_sinks(&config), Err(SinkError::Permanent(_))));
    }
}
