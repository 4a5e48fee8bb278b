// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batching and flush state machine for one sink.
//!
//! Items accumulate in an open batch. The batch closes when it reaches
//! `max_items` or when `max_wait` has elapsed since its first item,
//! whichever comes first. Closed batches queue up in arrival order and
//! are written one at a time; the head of the queue is the only batch in
//! flight. A failed head is retried with its exact contents until it is
//! written, so batches are confirmed in the order they closed.
//!
//! The machine performs no I/O and never reads the clock: every call takes
//! `now`, which keeps timing behaviour testable.
//!
//! ```text
//!            poll()            complete(Ok)
//!   OPEN ─────────────▶ FLUSHING ─────────────▶ OPEN
//!     ▲                  │    ▲
//!     │      Err, budget │    │ backoff elapsed
//!     │         left     ▼    │
//!     │              RETRY_WAIT
//!     │                  │
//!     │ probe ok         │ permanent / budget spent
//!     │                  ▼
//!     └──────────────  SUSPENDED  (probe every probe_interval)
//! ```

use crate::retry::RetryPolicy;
use crate::storage::SinkError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Flush lifecycle of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Accepting items, nothing in flight.
    Open,
    /// A batch write is in flight.
    Flushing,
    /// Last write failed; retrying the same batch at `until`.
    RetryWait { until: Instant },
    /// Retry budget spent or permanent error; probing at `next_probe`.
    Suspended { next_probe: Instant },
}

impl SinkState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Flushing => "flushing",
            Self::RetryWait { .. } => "retry_wait",
            Self::Suspended { .. } => "suspended",
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

/// A closed batch awaiting confirmation.
#[derive(Debug)]
pub struct Batch<T> {
    /// Close order, starting at 1.
    pub seq: u64,
    /// Items in arrival order; shared with in-flight writes.
    pub items: Arc<Vec<T>>,
    /// When the first item arrived.
    pub opened_at: Instant,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A write the driver must perform.
#[derive(Debug, Clone)]
pub struct FlushRequest<T> {
    pub seq: u64,
    pub items: Arc<Vec<T>>,
    /// 1 for the first write of this batch.
    pub attempt: u32,
    /// Recovery probe while suspended.
    pub probe: bool,
}

/// Result of [`FlushMachine::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// The batch is durable.
    Written {
        seq: u64,
        items: usize,
        /// The write succeeded after failures (retry or probe).
        recovered: bool,
    },
    /// Retrying the same batch after `delay`.
    Retrying { seq: u64, attempt: u32, delay: Duration },
    /// No more retries until the next probe.
    Suspended { seq: u64, attempts: u32, permanent: bool },
}

/// Batch/flush state for one sink.
#[derive(Debug)]
pub struct FlushMachine<T> {
    max_items: usize,
    max_wait: Duration,
    policy: RetryPolicy,
    probe_interval: Duration,

    open: Vec<T>,
    opened_at: Option<Instant>,
    closed: VecDeque<Batch<T>>,
    buffered: usize,
    next_seq: u64,

    state: SinkState,
    probing: bool,
    attempts: u32,
    first_failure_at: Option<Instant>,
    last_error: Option<String>,
    last_confirmed: Option<u64>,
}

impl<T> FlushMachine<T> {
    pub fn new(
        max_items: usize,
        max_wait: Duration,
        policy: RetryPolicy,
        probe_interval: Duration,
    ) -> Self {
        let max_items = max_items.max(1);
        Self {
            max_items,
            max_wait,
            policy,
            probe_interval,
            open: Vec::with_capacity(max_items),
            opened_at: None,
            closed: VecDeque::new(),
            buffered: 0,
            next_seq: 1,
            state: SinkState::Open,
            probing: false,
            attempts: 0,
            first_failure_at: None,
            last_error: None,
            last_confirmed: None,
        }
    }

    /// Add an item to the open batch, closing it when full.
    pub fn push(&mut self, item: T, now: Instant) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.open.push(item);
        self.buffered += 1;
        if self.open.len() >= self.max_items {
            self.close_open();
        }
    }

    /// Close the open batch if its wait ceiling has passed, then return
    /// the next write to perform, if one is due.
    pub fn poll(&mut self, now: Instant) -> Option<FlushRequest<T>> {
        if self.open_deadline().is_some_and(|deadline| now >= deadline) {
            self.close_open();
        }

        let probe = match self.state {
            SinkState::Open => false,
            SinkState::Flushing => return None,
            SinkState::RetryWait { until } if now >= until => false,
            SinkState::Suspended { next_probe } if now >= next_probe => true,
            SinkState::RetryWait { .. } | SinkState::Suspended { .. } => return None,
        };

        let head = self.closed.front()?;
        self.state = SinkState::Flushing;
        self.probing = probe;
        Some(FlushRequest {
            seq: head.seq,
            items: Arc::clone(&head.items),
            attempt: self.attempts + 1,
            probe,
        })
    }

    /// Record the result of the in-flight write. Returns `None` when no
    /// write was in flight.
    pub fn complete(&mut self, result: Result<(), SinkError>, now: Instant) -> Option<FlushOutcome> {
        if self.state != SinkState::Flushing {
            return None;
        }
        let seq = self.closed.front()?.seq;

        match result {
            Ok(()) => {
                let batch = self.closed.pop_front()?;
                self.buffered -= batch.len();
                let recovered = self.attempts > 0;
                self.attempts = 0;
                self.first_failure_at = None;
                self.last_error = None;
                self.probing = false;
                self.last_confirmed = Some(seq);
                self.state = SinkState::Open;
                Some(FlushOutcome::Written {
                    seq,
                    items: batch.len(),
                    recovered,
                })
            }
            Err(error) => {
                self.attempts = self.attempts.saturating_add(1);
                let first = *self.first_failure_at.get_or_insert(now);
                let permanent = error.is_permanent();
                self.last_error = Some(error.to_string());

                // A transient failure is always retried at least once.
                let exhausted = self.attempts > 1
                    && self
                        .policy
                        .is_exhausted(self.attempts, now.saturating_duration_since(first));
                if permanent || exhausted || self.probing {
                    self.probing = false;
                    self.state = SinkState::Suspended {
                        next_probe: now + self.probe_interval,
                    };
                    Some(FlushOutcome::Suspended {
                        seq,
                        attempts: self.attempts,
                        permanent,
                    })
                } else {
                    let delay = self.policy.delay(self.attempts);
                    self.state = SinkState::RetryWait { until: now + delay };
                    Some(FlushOutcome::Retrying {
                        seq,
                        attempt: self.attempts,
                        delay,
                    })
                }
            }
        }
    }

    /// Close the open batch regardless of size or age (shutdown).
    pub fn force_close(&mut self) {
        if !self.open.is_empty() {
            self.close_open();
        }
    }

    /// Drop everything still buffered, returning the item count.
    pub fn discard(&mut self) -> usize {
        let lost = self.buffered;
        self.open.clear();
        self.opened_at = None;
        self.closed.clear();
        self.buffered = 0;
        self.state = SinkState::Open;
        self.probing = false;
        lost
    }

    /// Earliest instant at which [`poll`](Self::poll) may have work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timer = match self.state {
            SinkState::RetryWait { until } => Some(until),
            SinkState::Suspended { next_probe } => Some(next_probe),
            SinkState::Open | SinkState::Flushing => None,
        };
        match (self.open_deadline(), timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Items accepted but not yet confirmed (open plus closed batches).
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Closed batches awaiting confirmation, including the in-flight one.
    pub fn pending_batches(&self) -> usize {
        self.closed.len()
    }

    /// Consecutive failed attempts of the head batch.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn first_failure_at(&self) -> Option<Instant> {
        self.first_failure_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Sequence number of the most recently written batch.
    pub fn last_confirmed(&self) -> Option<u64> {
        self.last_confirmed
    }

    /// Nothing buffered and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.buffered == 0 && self.state != SinkState::Flushing
    }

    fn open_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_wait)
    }

    fn close_open(&mut self) {
        let items = std::mem::replace(&mut self.open, Vec::with_capacity(self.max_items));
        let Some(opened_at) = self.opened_at.take() else {
            return;
        };
        self.closed.push_back(Batch {
            seq: self.next_seq,
            items: Arc::new(items),
            opened_at,
        });
        self.next_seq += 1;
    }
}
