// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription manager
//!
//! Owns the receive loop: every delivery is stamped with a receipt time,
//! archived, decoded, handed to both coordinators, and only then
//! acknowledged. A decode failure never stops archiving.
//!
//! Ingestion pauses (stops reading from the bus) while either sink is
//! suspended or has `buffer_ceiling` items outstanding, and resumes once
//! neither is suspended and both are at or below `low_water`. Unread
//! messages stay with the broker in the meantime.

use crate::bus::{BusMessage, MessageBus, TransportError};
use crate::config::BackpressureConfig;
use crate::coordinator::{CoordinatorClosed, CoordinatorHandle, SinkStatus};
use crate::decoder::{DecodeOutcome, PayloadDecoder};
use crate::error::BridgeError;
use crate::model::{RawMessage, Reading, SinkKind};
use crate::retry::{Backoff, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Wall-clock source for receipt timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Receipt timestamps that never go backwards, even if the wall clock does.
pub struct ReceiptClock {
    clock: Arc<dyn Clock>,
    last: Option<DateTime<Utc>>,
}

impl ReceiptClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, last: None }
    }

    /// Timestamp for the next received message.
    pub fn stamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let stamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

impl Default for ReceiptClock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Ingestion counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub messages_acked: AtomicU64,
    pub readings_produced: AtomicU64,
    pub decode_failures: AtomicU64,
    pub partial_decodes: AtomicU64,
    pub ack_failures: AtomicU64,
    pub transport_errors: AtomicU64,
    pub pauses: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            readings_produced: self.readings_produced.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            partial_decodes: self.partial_decodes.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub messages_received: u64,
    pub messages_acked: u64,
    pub readings_produced: u64,
    pub decode_failures: u64,
    pub partial_decodes: u64,
    pub ack_failures: u64,
    pub transport_errors: u64,
    pub pauses: u64,
}

/// Why ingestion is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Suspended(SinkKind),
    Backlog { kind: SinkKind, buffered: usize },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspended(kind) => write!(f, "{} sink suspended", kind),
            Self::Backlog { kind, buffered } => {
                write!(f, "{} sink has {} items buffered", kind, buffered)
            }
        }
    }
}

/// Gate decision with hysteresis: a running loop pauses at the ceiling,
/// a paused loop resumes only at or below the low-water mark.
pub fn pause_reason(
    statuses: [&SinkStatus; 2],
    config: &BackpressureConfig,
    paused: bool,
) -> Option<PauseReason> {
    if let Some(status) = statuses.iter().find(|s| s.is_suspended()) {
        return Some(PauseReason::Suspended(status.kind));
    }

    let limit_exceeded = |s: &&&SinkStatus| {
        if paused {
            s.buffered > config.low_water
        } else {
            s.buffered >= config.buffer_ceiling
        }
    };
    statuses
        .iter()
        .find(limit_exceeded)
        .map(|s| PauseReason::Backlog {
            kind: s.kind,
            buffered: s.buffered,
        })
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested.
    Shutdown,
    /// The bus reported it will deliver nothing more.
    BusClosed,
}

/// Receive loop from the bus to the two coordinators.
pub struct SubscriptionManager<B> {
    bus: B,
    decoder: PayloadDecoder,
    raw: CoordinatorHandle<RawMessage>,
    readings: CoordinatorHandle<Reading>,
    backpressure: BackpressureConfig,
    reconnect: Backoff,
    receipt: ReceiptClock,
    stats: Arc<IngestStats>,
}

impl<B: MessageBus> SubscriptionManager<B> {
    pub fn new(
        bus: B,
        decoder: PayloadDecoder,
        raw: CoordinatorHandle<RawMessage>,
        readings: CoordinatorHandle<Reading>,
        backpressure: BackpressureConfig,
        reconnect: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            decoder,
            raw,
            readings,
            backpressure,
            reconnect: Backoff::new(reconnect),
            receipt: ReceiptClock::default(),
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Use `clock` for receipt timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.receipt = ReceiptClock::new(clock);
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown is signalled (`true` on `shutdown`) or the bus
    /// closes. Dropping the manager on return closes both coordinators'
    /// inputs, which starts their drain.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<ExitReason, BridgeError> {
        info!("Subscription manager started");
        let result = self.receive(shutdown).await;

        // Also on error, so queued acks go out and the session ends cleanly.
        if let Err(e) = self.bus.disconnect().await {
            warn!("Bus disconnect failed: {}", e);
        }
        info!(stats = ?self.stats.snapshot(), "Subscription manager stopped");
        result
    }

    async fn receive(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ExitReason, BridgeError> {
        let mut raw_status = self.raw.subscribe_status();
        let mut readings_status = self.readings.subscribe_status();
        let mut paused = false;
        let ceiling = self.backpressure.buffer_ceiling;

        let exit = loop {
            // Backpressure gate.
            loop {
                let reason = {
                    let raw = raw_status.borrow_and_update();
                    let readings = readings_status.borrow_and_update();
                    self.check_coupled(&raw, &readings)?;
                    pause_reason([&raw, &readings], &self.backpressure, paused)
                };
                match (reason, paused) {
                    (None, false) => break,
                    (None, true) => {
                        paused = false;
                        info!("Ingestion resumed");
                        break;
                    }
                    (Some(reason), false) => {
                        paused = true;
                        self.stats.pauses.fetch_add(1, Ordering::Relaxed);
                        warn!(%reason, "Ingestion paused");
                    }
                    (Some(_), true) => {}
                }

                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    changed = raw_status.changed() => {
                        changed.map_err(|_| CoordinatorClosed(SinkKind::Raw))?;
                    }
                    changed = readings_status.changed() => {
                        changed.map_err(|_| CoordinatorClosed(SinkKind::Readings))?;
                    }
                }
            }
            if *shutdown.borrow() {
                break ExitReason::Shutdown;
            }

            let delivery = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break ExitReason::Shutdown,
                closed = gate_trigger(&mut raw_status, &mut readings_status, ceiling) => {
                    closed?;
                    continue;
                }
                delivery = self.bus.recv() => delivery,
            };

            match delivery {
                Ok(message) => {
                    if self.reconnect.attempts() > 0 {
                        info!(
                            failures = self.reconnect.attempts(),
                            "Bus delivery resumed"
                        );
                    }
                    self.reconnect.reset();
                    self.handle(message).await?;
                }
                Err(TransportError::Closed) => {
                    info!("Bus closed");
                    break ExitReason::BusClosed;
                }
                Err(e) => {
                    self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = self.reconnect.next_delay();
                    error!(
                        attempt = self.reconnect.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Bus transport error: {}",
                        e
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break ExitReason::Shutdown,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        Ok(exit)
    }

    /// Archive, decode, hand off, then acknowledge one delivery.
    async fn handle(&mut self, message: BusMessage) -> Result<(), BridgeError> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let received_at = self.receipt.stamp();
        let BusMessage {
            topic,
            payload,
            ack,
        } = message;

        let (readings, outcome) = self.decoder.decode(&topic, &payload, received_at);
        match &outcome {
            DecodeOutcome::Complete => {
                debug!(topic = %topic, readings = readings.len(), "Decoded message");
            }
            DecodeOutcome::Partial { skipped } => {
                self.stats.partial_decodes.fetch_add(1, Ordering::Relaxed);
                let fields: Vec<String> = skipped.iter().map(ToString::to_string).collect();
                warn!(
                    topic = %topic,
                    readings = readings.len(),
                    skipped = %fields.join(", "),
                    "Partial decode"
                );
            }
            DecodeOutcome::Failed(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %topic, bytes = payload.len(), "Decode failed: {}", e);
            }
        }
        self.stats
            .readings_produced
            .fetch_add(readings.len() as u64, Ordering::Relaxed);

        self.raw
            .submit(RawMessage::new(received_at, topic, payload))
            .await?;
        for reading in readings {
            self.readings.submit(reading).await?;
        }

        match self.bus.ack(ack).await {
            Ok(()) => {
                self.stats.messages_acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The broker may redeliver; duplicates are tolerated downstream.
                self.stats.ack_failures.fetch_add(1, Ordering::Relaxed);
                warn!(pkid = ack.pkid, "Ack failed: {}", e);
            }
        }
        Ok(())
    }

    fn check_coupled(&self, raw: &SinkStatus, readings: &SinkStatus) -> Result<(), BridgeError> {
        if !self.backpressure.coupled_shutdown {
            return Ok(());
        }
        match [raw, readings].into_iter().find(|s| s.is_suspended()) {
            Some(status) => {
                error!(sink = %status.kind, "Sink suspended, stopping bridge (coupled shutdown)");
                Err(BridgeError::SinkSuspended {
                    kind: status.kind,
                    last_error: status.last_error.clone().unwrap_or_default(),
                })
            }
            None => Ok(()),
        }
    }
}

/// Resolves when either sink reaches a state that closes the gate.
async fn gate_trigger(
    raw: &mut watch::Receiver<SinkStatus>,
    readings: &mut watch::Receiver<SinkStatus>,
    ceiling: usize,
) -> Result<(), CoordinatorClosed> {
    let closes = |s: &SinkStatus| s.is_suspended() || s.buffered >= ceiling;
    tokio::select! {
        changed = raw.wait_for(closes) => changed.map(|_| ()).map_err(|_| CoordinatorClosed(SinkKind::Raw)),
        changed = readings.wait_for(closes) => {
            changed.map(|_| ()).map_err(|_| CoordinatorClosed(SinkKind::Readings))
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
