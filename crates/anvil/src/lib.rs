// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anvil Telemetry Bridge
//!
//! Subscribes to device telemetry on an MQTT broker, decodes JSON payloads
//! into per-sensor readings and persists both the raw messages and the
//! readings to a time-series database.
//!
//! # Features
//!
//! - **At-least-once delivery** -- a message is acknowledged only after both
//!   sinks have accepted it
//! - **Batching** -- size and age triggers per sink, one transaction per batch
//! - **Retry** -- exponential backoff with jitter, strict batch ordering
//! - **Suspension** -- a failing sink is probed until it recovers
//! - **Backpressure** -- ingestion pauses while a sink is suspended or its
//!   buffer is above the ceiling
//! - **Backends** -- PostgreSQL/TimescaleDB and SQLite
//!
//! # Architecture
//!
//! ```text
//! MessageBus (MQTT)
//!     |
//!     v
//! SubscriptionManager --- PayloadDecoder
//!     |            \
//!     v             v
//! Coordinator<RawMessage>   Coordinator<Reading>
//!     |  FlushMachine           |  FlushMachine
//!     v                         v
//! BatchSink (raw archive)   BatchSink (readings)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use anvil::{bridge, BridgeConfig};
//! use tokio::sync::watch;
//!
//! let config = BridgeConfig::from_file("anvil.toml")?;
//! let (_stop, shutdown) = watch::channel(false);
//! let report = bridge::run(&config, shutdown).await?;
//! ```

pub mod batch;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod model;
pub mod retry;
pub mod storage;
pub mod subscription;
pub mod topic;

pub use batch::{FlushMachine, FlushOutcome, SinkState};
pub use bridge::{run_with, BridgeReport};
pub use bus::{AckToken, BusMessage, MessageBus, MockBus, MockBusController, MqttBus, TransportError};
pub use config::{BridgeConfig, ConfigError};
pub use coordinator::{
    spawn_coordinator, CoordinatorHandle, CoordinatorSettings, DrainReport, SinkStatus,
};
pub use decoder::{DecodeError, DecodeOutcome, PayloadDecoder};
pub use error::{BridgeError, Result};
pub use model::{RawMessage, Reading, SinkKind};
pub use retry::{Backoff, RetryPolicy};
pub use storage::{open_sinks, BatchSink, MockSink, SinkError, Sinks};
pub use subscription::{ExitReason, SubscriptionManager};
pub use topic::{topic_matches, DeviceMapper, DeviceRule};
