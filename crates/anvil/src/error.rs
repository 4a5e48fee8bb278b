// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge-level errors.

use crate::bus::TransportError;
use crate::config::ConfigError;
use crate::coordinator::CoordinatorClosed;
use crate::model::SinkKind;
use crate::storage::SinkError;
use thiserror::Error;

/// Errors that stop the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] SinkError),

    #[error("bus error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    CoordinatorClosed(#[from] CoordinatorClosed),

    /// A sink was suspended while `coupled_shutdown` is set.
    #[error("{kind} sink suspended: {last_error}")]
    SinkSuspended { kind: SinkKind, last_error: String },

    /// Buffered items were not persisted before the process stopped.
    #[error("shutdown lost {lost_items} buffered items")]
    DataLoss { lost_items: usize },

    #[error("forced shutdown")]
    ForcedShutdown,

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::SinkSuspended {
            kind: SinkKind::Readings,
            last_error: "permanent: undefined table".into(),
        };
        assert_eq!(
            err.to_string(),
            "readings sink suspended: permanent: undefined table"
        );

        let err: BridgeError = CoordinatorClosed(SinkKind::Raw).into();
        assert_eq!(err.to_string(), "raw coordinator has stopped");

        let err: BridgeError = ConfigError::Invalid("No topics configured".into()).into();
        assert_eq!(
            err.to_string(),
            "configuration error: Invalid configuration: No topics configured"
        );
    }
}
