// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge wiring
//!
//! Builds the decoder, both coordinators and the subscription manager
//! from a [`BridgeConfig`], runs them until shutdown, then drains.

use crate::bus::{MessageBus, MqttBus};
use crate::config::BridgeConfig;
use crate::coordinator::{spawn_coordinator, CoordinatorSettings, SinkStats, SinkStatsSnapshot};
use crate::decoder::PayloadDecoder;
use crate::error::BridgeError;
use crate::model::SinkKind;
use crate::storage::{open_sinks, Sinks};
use crate::subscription::{ExitReason, IngestStats, IngestStatsSnapshot, SubscriptionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Interval between periodic statistics logs.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Final statistics of a bridge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    pub exit: ExitReason,
    pub ingest: IngestStatsSnapshot,
    pub raw: SinkStatsSnapshot,
    pub readings: SinkStatsSnapshot,
}

/// Connect to the configured bus and storage and run until `shutdown`.
pub async fn run(
    config: &BridgeConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<BridgeReport, BridgeError> {
    let sinks = open_sinks(&config.storage)?;
    let bus = MqttBus::new(&config.bus)?;

    info!(
        broker = %format!("{}:{}", config.bus.host, config.bus.port),
        topics = ?config.bus.topics,
        backend = ?config.storage.backend,
        "Starting bridge"
    );
    run_with(config, bus, sinks, shutdown).await
}

/// Run the pipeline over an already-built bus and sinks.
pub async fn run_with<B: MessageBus>(
    config: &BridgeConfig,
    bus: B,
    sinks: Sinks,
    shutdown: watch::Receiver<bool>,
) -> Result<BridgeReport, BridgeError> {
    let decoder = PayloadDecoder::from_config(&config.decoder)?;
    let settings = CoordinatorSettings::from_config(config);

    let (raw, raw_task) = spawn_coordinator(SinkKind::Raw, sinks.raw, settings.clone());
    let (readings, readings_task) = spawn_coordinator(SinkKind::Readings, sinks.readings, settings);
    let raw_stats = raw.stats();
    let readings_stats = readings.stats();

    let manager = SubscriptionManager::new(
        bus,
        decoder,
        raw,
        readings,
        config.backpressure.clone(),
        config.bus.reconnect.policy(),
    );
    let ingest_stats = manager.stats();

    let reporter = tokio::spawn(report_periodically(
        Arc::clone(&ingest_stats),
        Arc::clone(&raw_stats),
        Arc::clone(&readings_stats),
    ));

    // Returning drops the manager and with it the coordinator inputs.
    let result = manager.run(shutdown).await;
    if let Err(e) = &result {
        error!("Receive loop stopped: {}", e);
    }
    info!("Draining buffered batches");

    let (raw_drain, readings_drain) = tokio::join!(raw_task, readings_task);
    reporter.abort();

    let report = BridgeReport {
        exit: ExitReason::Shutdown,
        ingest: ingest_stats.snapshot(),
        raw: raw_stats.snapshot(),
        readings: readings_stats.snapshot(),
    };
    log_stats("Final statistics", &report.ingest, &report.raw, &report.readings);

    let exit = result?;
    let lost_items = raw_drain?.lost_items + readings_drain?.lost_items;
    if lost_items > 0 {
        return Err(BridgeError::DataLoss { lost_items });
    }

    info!(?exit, "Bridge stopped");
    Ok(BridgeReport { exit, ..report })
}

async fn report_periodically(
    ingest: Arc<IngestStats>,
    raw: Arc<SinkStats>,
    readings: Arc<SinkStats>,
) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        log_stats(
            "Statistics",
            &ingest.snapshot(),
            &raw.snapshot(),
            &readings.snapshot(),
        );
    }
}

fn log_stats(
    label: &str,
    ingest: &IngestStatsSnapshot,
    raw: &SinkStatsSnapshot,
    readings: &SinkStatsSnapshot,
) {
    info!(
        received = ingest.messages_received,
        acked = ingest.messages_acked,
        decode_failures = ingest.decode_failures,
        partial = ingest.partial_decodes,
        transport_errors = ingest.transport_errors,
        pauses = ingest.pauses,
        raw_written = raw.items_written,
        raw_retries = raw.retries,
        raw_suspensions = raw.suspensions,
        readings_written = readings.items_written,
        readings_retries = readings.retries,
        readings_suspensions = readings.suspensions,
        "{}",
        label
    );
}
