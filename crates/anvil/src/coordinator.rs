// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch coordinator
//!
//! One task per sink drives a [`FlushMachine`]: it receives items on a
//! bounded channel, dispatches due flushes to the sink as separate tasks
//! (so items keep arriving while a write is in flight), applies the write
//! timeout, and publishes the sink status on a `watch` channel for the
//! subscription manager's backpressure gate.
//!
//! Closing every [`CoordinatorHandle`] starts the drain: the open batch is
//! closed immediately and the coordinator keeps flushing (retries
//! included) until everything is confirmed or the drain timeout expires.

use crate::batch::{FlushMachine, FlushOutcome, FlushRequest, SinkState};
use crate::config::BridgeConfig;
use crate::model::SinkKind;
use crate::retry::RetryPolicy;
use crate::storage::{BatchSink, SinkError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The coordinator task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} coordinator has stopped")]
pub struct CoordinatorClosed(pub SinkKind);

/// Coordinator tuning, shared by both sinks.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_items: usize,
    pub max_wait: Duration,
    pub policy: RetryPolicy,
    pub probe_interval: Duration,
    pub write_timeout: Duration,
    pub drain_timeout: Duration,
    /// Items queued between the receive loop and the coordinator.
    pub channel_capacity: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_items: config.batch.max_items,
            max_wait: config.batch.max_wait(),
            policy: config.retry.policy(),
            probe_interval: config.retry.probe_interval(),
            write_timeout: config.storage.write_timeout(),
            drain_timeout: config.shutdown.drain_timeout(),
            channel_capacity: config.batch.max_items,
        }
    }
}

/// Point-in-time view of one sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkStatus {
    pub kind: SinkKind,
    pub state: SinkState,
    /// Items accepted but not yet confirmed.
    pub buffered: usize,
    /// Closed batches awaiting confirmation.
    pub pending_batches: usize,
    /// Consecutive failed attempts of the head batch.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Sequence number of the last written batch.
    pub last_confirmed: Option<u64>,
}

impl SinkStatus {
    fn initial(kind: SinkKind) -> Self {
        Self {
            kind,
            state: SinkState::Open,
            buffered: 0,
            pending_batches: 0,
            attempts: 0,
            last_error: None,
            last_confirmed: None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }
}

/// Per-sink counters.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub items_accepted: AtomicU64,
    pub items_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub flush_failures: AtomicU64,
    pub retries: AtomicU64,
    pub suspensions: AtomicU64,
    pub recoveries: AtomicU64,
    /// Items discarded when the drain timed out.
    pub items_lost: AtomicU64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            items_accepted: self.items_accepted.load(Ordering::Relaxed),
            items_written: self.items_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            items_lost: self.items_lost.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`SinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub items_accepted: u64,
    pub items_written: u64,
    pub batches_written: u64,
    pub flush_failures: u64,
    pub retries: u64,
    pub suspensions: u64,
    pub recoveries: u64,
    pub items_lost: u64,
}

/// How a coordinator finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub kind: SinkKind,
    /// Items still unconfirmed when the drain timeout expired.
    pub lost_items: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.lost_items == 0
    }
}

/// Sender side of a coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle<T> {
    kind: SinkKind,
    tx: mpsc::Sender<T>,
    status: watch::Receiver<SinkStatus>,
    stats: Arc<SinkStats>,
}

impl<T> Clone for CoordinatorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            tx: self.tx.clone(),
            status: self.status.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> CoordinatorHandle<T> {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// Hand an item to the coordinator, waiting while its queue is full.
    pub async fn submit(&self, item: T) -> Result<(), CoordinatorClosed> {
        self.tx
            .send(item)
            .await
            .map_err(|_| CoordinatorClosed(self.kind))
    }

    /// Latest published status.
    pub fn status(&self) -> SinkStatus {
        self.status.borrow().clone()
    }

    /// Status receiver for change notifications.
    pub fn subscribe_status(&self) -> watch::Receiver<SinkStatus> {
        self.status.clone()
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }
}

/// Start a coordinator task for `sink`.
pub fn spawn_coordinator<T>(
    kind: SinkKind,
    sink: Arc<dyn BatchSink<T>>,
    settings: CoordinatorSettings,
) -> (CoordinatorHandle<T>, JoinHandle<DrainReport>)
where
    T: Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(SinkStatus::initial(kind));
    let stats = Arc::new(SinkStats::default());

    let coordinator = Coordinator {
        kind,
        machine: FlushMachine::new(
            settings.max_items,
            settings.max_wait,
            settings.policy.clone(),
            settings.probe_interval,
        ),
        sink,
        rx,
        status_tx,
        stats: Arc::clone(&stats),
        settings,
    };
    let task = tokio::spawn(coordinator.run());

    (
        CoordinatorHandle {
            kind,
            tx,
            status: status_rx,
            stats,
        },
        task,
    )
}

type Flight = JoinHandle<Result<(), SinkError>>;

struct Coordinator<T> {
    kind: SinkKind,
    sink: Arc<dyn BatchSink<T>>,
    machine: FlushMachine<T>,
    rx: mpsc::Receiver<T>,
    status_tx: watch::Sender<SinkStatus>,
    stats: Arc<SinkStats>,
    settings: CoordinatorSettings,
}

impl<T: Send + Sync + 'static> Coordinator<T> {
    async fn run(mut self) -> DrainReport {
        info!(sink = %self.kind, backend = %self.sink.name(), "Coordinator started");

        let mut flight: Option<Flight> = None;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            // Polled on every pass so an overdue open batch is closed even
            // while a write is in flight; no request comes back while Flushing.
            if let Some(request) = self.machine.poll(now()) {
                debug_assert!(flight.is_none());
                flight = Some(self.dispatch(request));
            }
            self.publish();

            if let Some(deadline) = drain_deadline {
                if flight.is_none() && self.machine.is_idle() {
                    info!(sink = %self.kind, "Drained");
                    return self.report(0);
                }
                if Instant::now() >= deadline {
                    if let Some(task) = flight.take() {
                        task.abort();
                    }
                    let lost = self.machine.discard();
                    self.stats.items_lost.fetch_add(lost as u64, Ordering::Relaxed);
                    self.publish();
                    error!(
                        sink = %self.kind,
                        items = lost,
                        last_error = self.machine.last_error().unwrap_or("none"),
                        "Drain timed out, buffered items were not persisted"
                    );
                    return self.report(lost);
                }
            }

            let wake_at = match (self.machine.next_deadline().map(Instant::from_std), drain_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                result = land(&mut flight), if flight.is_some() => {
                    flight = None;
                    self.on_complete(result);
                }
                item = self.rx.recv(), if drain_deadline.is_none() => match item {
                    Some(item) => {
                        self.stats.items_accepted.fetch_add(1, Ordering::Relaxed);
                        self.machine.push(item, now());
                    }
                    None => {
                        info!(
                            sink = %self.kind,
                            buffered = self.machine.buffered(),
                            "Input closed, draining"
                        );
                        self.machine.force_close();
                        drain_deadline = Some(Instant::now() + self.settings.drain_timeout);
                    }
                },
                _ = sleep_until(wake_at), if wake_at.is_some() => {}
            }
        }
    }

    fn dispatch(&self, request: FlushRequest<T>) -> Flight {
        trace!(
            sink = %self.kind,
            batch = request.seq,
            items = request.items.len(),
            attempt = request.attempt,
            probe = request.probe,
            "Flushing batch"
        );

        let sink = Arc::clone(&self.sink);
        let timeout = self.settings.write_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, sink.write_batch(&request.items)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::transient(format!(
                    "write timed out after {} ms",
                    timeout.as_millis()
                ))),
            }
        })
    }

    fn on_complete(&mut self, result: Result<(), SinkError>) {
        if result.is_err() {
            self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
        let Some(outcome) = self.machine.complete(result, now()) else {
            return;
        };

        match outcome {
            FlushOutcome::Written {
                seq,
                items,
                recovered,
            } => {
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats.items_written.fetch_add(items as u64, Ordering::Relaxed);
                if recovered {
                    self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                    info!(sink = %self.kind, batch = seq, items, "Sink recovered");
                } else {
                    debug!(sink = %self.kind, batch = seq, items, "Batch written");
                }
            }
            FlushOutcome::Retrying {
                seq,
                attempt,
                delay,
            } => {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sink = %self.kind,
                    batch = seq,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = self.machine.last_error().unwrap_or(""),
                    "Flush failed, retrying"
                );
            }
            FlushOutcome::Suspended {
                seq,
                attempts,
                permanent,
            } => {
                self.stats.suspensions.fetch_add(1, Ordering::Relaxed);
                error!(
                    sink = %self.kind,
                    batch = seq,
                    attempts,
                    permanent,
                    last_error = self.machine.last_error().unwrap_or(""),
                    probe_in_ms = self.settings.probe_interval.as_millis() as u64,
                    "Sink suspended"
                );
            }
        }
    }

    fn publish(&self) {
        let status = SinkStatus {
            kind: self.kind,
            state: self.machine.state(),
            buffered: self.machine.buffered(),
            pending_batches: self.machine.pending_batches(),
            attempts: self.machine.attempts(),
            last_error: self.machine.last_error().map(str::to_string),
            last_confirmed: self.machine.last_confirmed(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn report(&self, lost_items: usize) -> DrainReport {
        DrainReport {
            kind: self.kind,
            lost_items,
        }
    }
}

/// Await the in-flight write; pending forever when there is none.
async fn land(flight: &mut Option<Flight>) -> Result<(), SinkError> {
    match flight {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(SinkError::transient(format!("write task failed: {}", e))),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Machine time, read from the tokio clock.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockSink;

    fn settings(max_items: usize, max_wait: Duration) -> CoordinatorSettings {
        CoordinatorSettings {
            max_items,
            max_wait,
            policy: RetryPolicy {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.0,
                max_attempts: 3,
                max_elapsed: None,
            },
            probe_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
            channel_capacity: 16,
        }
    }

    fn spawn(
        sink: &Arc<MockSink<u32>>,
        settings: CoordinatorSettings,
    ) -> (CoordinatorHandle<u32>, JoinHandle<DrainReport>) {
        spawn_coordinator(SinkKind::Readings, sink.clone() as Arc<dyn BatchSink<u32>>, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_ceiling_flushes() {
        let sink = Arc::new(MockSink::new("mock"));
        let (handle, _task) = spawn(&sink, settings(3, Duration::from_secs(3600)));
        let mut status = handle.subscribe_status();

        for i in 0..3 {
            handle.submit(i).await.unwrap();
        }
        status
            .wait_for(|s| s.last_confirmed == Some(1))
            .await
            .unwrap();

        assert_eq!(sink.batches(), vec![vec![0, 1, 2]]);
        assert_eq!(handle.stats().snapshot().batches_written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ceiling_flushes_partial_batch() {
        let sink = Arc::new(MockSink::new("mock"));
        let (handle, _task) = spawn(&sink, settings(100, Duration::from_millis(500)));
        let mut status = handle.subscribe_status();

        let start = Instant::now();
        handle.submit(7).await.unwrap();
        status
            .wait_for(|s| s.last_confirmed == Some(1))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(sink.items(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_in_order() {
        let sink = Arc::new(MockSink::new("mock"));
        sink.fail_next(SinkError::transient("connection reset"));
        sink.fail_next(SinkError::transient("connection reset"));
        let (handle, _task) = spawn(&sink, settings(2, Duration::from_secs(3600)));
        let mut status = handle.subscribe_status();

        for i in 0..6 {
            handle.submit(i).await.unwrap();
        }
        status
            .wait_for(|s| s.last_confirmed == Some(3))
            .await
            .unwrap();

        assert_eq!(sink.batches(), vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
        let stats = handle.stats().snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.items_written, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_and_probe_recovery() {
        let sink = Arc::new(MockSink::new("mock"));
        sink.set_outage(Some(SinkError::transient("database unavailable")));
        let (handle, _task) = spawn(&sink, settings(1, Duration::from_secs(3600)));
        let mut status = handle.subscribe_status();

        handle.submit(1).await.unwrap();
        let suspended = status.wait_for(|s| s.is_suspended()).await.unwrap().clone();
        assert_eq!(suspended.attempts, 3);
        assert_eq!(suspended.buffered, 1);
        assert_eq!(
            suspended.last_error.as_deref(),
            Some("transient: database unavailable")
        );

        // Items keep buffering while suspended.
        handle.submit(2).await.unwrap();

        sink.set_outage(None);
        status
            .wait_for(|s| s.state == SinkState::Open && s.buffered == 0)
            .await
            .unwrap();
        assert_eq!(sink.batches(), vec![vec![1], vec![2]]);
        assert_eq!(handle.stats().snapshot().suspensions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_suspends_without_retry() {
        let sink = Arc::new(MockSink::new("mock"));
        sink.fail_next(SinkError::permanent("relation \"telemetry\" does not exist"));
        let (handle, _task) = spawn(&sink, settings(1, Duration::from_secs(3600)));
        let mut status = handle.subscribe_status();

        handle.submit(1).await.unwrap();
        status.wait_for(|s| s.is_suspended()).await.unwrap();
        assert_eq!(sink.attempts(), 1);
        assert_eq!(handle.stats().snapshot().retries, 0);

        // Next probe succeeds.
        status
            .wait_for(|s| s.last_confirmed == Some(1))
            .await
            .unwrap();
        assert_eq!(sink.items(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_is_transient() {
        let sink = Arc::new(MockSink::new("mock").with_delay(Duration::from_secs(5)));
        let (handle, _task) = spawn(&sink, settings(1, Duration::from_secs(3600)));
        let mut status = handle.subscribe_status();

        handle.submit(1).await.unwrap();
        let failed = status
            .wait_for(|s| s.attempts >= 1)
            .await
            .unwrap()
            .clone();
        assert_eq!(
            failed.last_error.as_deref(),
            Some("transient: write timed out after 1000 ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ceiling_passes_during_slow_write() {
        let sink = Arc::new(MockSink::new("mock").with_delay(Duration::from_millis(500)));
        let (handle, _task) = spawn(&sink, settings(100, Duration::from_millis(100)));
        let mut status = handle.subscribe_status();

        let start = Instant::now();
        handle.submit(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Arrives while the first batch is being written.
        handle.submit(2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let queued = handle.status();
        assert_eq!(queued.state, SinkState::Flushing);
        assert_eq!(queued.pending_batches, 2);

        status
            .wait_for(|s| s.last_confirmed == Some(2))
            .await
            .unwrap();
        assert_eq!(sink.batches(), vec![vec![1], vec![2]]);
        // 100 ms wait + two 500 ms writes back to back.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_100));
        assert!(elapsed < Duration::from_millis(1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_flushes_open_batch() {
        let sink = Arc::new(MockSink::new("mock"));
        let (handle, task) = spawn(&sink, settings(100, Duration::from_secs(3600)));

        handle.submit(1).await.unwrap();
        handle.submit(2).await.unwrap();
        drop(handle);

        let report = task.await.unwrap();
        assert!(report.is_clean());
        assert_eq!(sink.batches(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_reports_loss() {
        let sink = Arc::new(MockSink::new("mock"));
        sink.set_outage(Some(SinkError::transient("down")));
        let (handle, task) = spawn(&sink, settings(100, Duration::from_secs(3600)));
        let stats = handle.stats();

        for i in 0..4 {
            handle.submit(i).await.unwrap();
        }
        drop(handle);

        let report = task.await.unwrap();
        assert_eq!(report.lost_items, 4);
        assert_eq!(stats.snapshot().items_lost, 4);
        assert!(sink.items().is_empty());
    }
}
