// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory sink with scripted failures.

use super::{BatchSink, SinkError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct MockState<T> {
    batches: Vec<Vec<T>>,
    attempts: usize,
    scripted: VecDeque<SinkError>,
    outage: Option<SinkError>,
}

/// Mock sink for testing without a database
///
/// Records every committed batch in order. Failures can be queued one at
/// a time (`fail_next`) or held until cleared (`set_outage`).
pub struct MockSink<T> {
    name: String,
    delay: Duration,
    state: Mutex<MockState<T>>,
}

impl<T: Clone> MockSink<T> {
    /// Create a new mock sink
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            state: Mutex::new(MockState {
                batches: Vec::new(),
                attempts: 0,
                scripted: VecDeque::new(),
                outage: None,
            }),
        }
    }

    /// Make every write take `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next write (queued after earlier scripted failures).
    pub fn fail_next(&self, error: SinkError) {
        self.lock().scripted.push_back(error);
    }

    /// Fail every write with `error` until called with `None`.
    pub fn set_outage(&self, error: Option<SinkError>) {
        self.lock().outage = error;
    }

    /// Committed batches in commit order.
    pub fn batches(&self) -> Vec<Vec<T>> {
        self.lock().batches.clone()
    }

    /// Committed items in commit order.
    pub fn items(&self) -> Vec<T> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Write calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, MockState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<T> BatchSink<T> for MockSink<T>
where
    T: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_batch(&self, items: &[T]) -> Result<(), SinkError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.outage {
            return Err(err.clone());
        }
        state.batches.push(items.to_vec());
        tracing::trace!(sink = %self.name, items = items.len(), "MockSink: batch committed");
        Ok(())
    }
}
