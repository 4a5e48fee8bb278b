// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message bus interface
//!
//! The bridge consumes a topic-addressed publish/subscribe bus with
//! at-least-once delivery: a message stays the bus's responsibility
//! until it is acknowledged, and unacknowledged messages may be
//! redelivered after a reconnect.

mod mqtt;

pub use mqtt::MqttBus;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Bus transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection lost or refused; the next `recv` reconnects.
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker rejected a subscription.
    #[error("subscription rejected: {0}")]
    Subscribe(String),

    /// The bus will deliver nothing more.
    #[error("bus closed")]
    Closed,
}

/// Handle used to acknowledge one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckToken {
    /// Packet identifier (0 for QoS 0 deliveries).
    pub pkid: u16,
    /// Delivery QoS.
    pub qos: u8,
}

/// A delivery from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ack: AckToken,
}

/// Topic-addressed subscribe-only bus client.
#[async_trait]
pub trait MessageBus: Send {
    /// Wait for the next message. Connection-level failures are returned
    /// as errors; calling `recv` again resumes (and reconnects).
    async fn recv(&mut self) -> Result<BusMessage, TransportError>;

    /// Acknowledge a delivery so the bus stops tracking it.
    async fn ack(&mut self, token: AckToken) -> Result<(), TransportError>;

    /// Disconnect cleanly. Unacknowledged deliveries may be redelivered
    /// on the next session.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

enum MockEvent {
    Message(BusMessage),
    Error(TransportError),
}

#[derive(Default)]
struct MockLedger {
    acked: Vec<AckToken>,
    next_pkid: u16,
    disconnected: bool,
}

/// Mock bus for testing without a broker
///
/// Deliveries and transport errors are injected through a
/// [`MockBusController`]. Dropping every controller closes the bus once
/// the queued events are consumed.
pub struct MockBus {
    inbox: mpsc::UnboundedReceiver<MockEvent>,
    ledger: Arc<Mutex<MockLedger>>,
}

/// Injects events into a [`MockBus`] and inspects its acknowledgements.
#[derive(Clone)]
pub struct MockBusController {
    tx: mpsc::UnboundedSender<MockEvent>,
    ledger: Arc<Mutex<MockLedger>>,
}

impl MockBus {
    /// Create a bus and its controller
    pub fn new() -> (Self, MockBusController) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let ledger = Arc::new(Mutex::new(MockLedger::default()));
        (
            Self {
                inbox,
                ledger: Arc::clone(&ledger),
            },
            MockBusController { tx, ledger },
        )
    }
}

impl MockBusController {
    /// Queue a QoS 1 delivery, returning its packet id.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> u16 {
        let pkid = {
            let mut ledger = lock(&self.ledger);
            ledger.next_pkid = ledger.next_pkid.wrapping_add(1).max(1);
            ledger.next_pkid
        };
        let _ = self.tx.send(MockEvent::Message(BusMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            ack: AckToken { pkid, qos: 1 },
        }));
        pkid
    }

    /// Queue a transport error.
    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.send(MockEvent::Error(error));
    }

    /// Packet ids acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<u16> {
        lock(&self.ledger).acked.iter().map(|t| t.pkid).collect()
    }

    pub fn is_disconnected(&self) -> bool {
        lock(&self.ledger).disconnected
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn recv(&mut self) -> Result<BusMessage, TransportError> {
        match self.inbox.recv().await {
            Some(MockEvent::Message(msg)) => Ok(msg),
            Some(MockEvent::Error(err)) => Err(err),
            None => Err(TransportError::Closed),
        }
    }

    async fn ack(&mut self, token: AckToken) -> Result<(), TransportError> {
        lock(&self.ledger).acked.push(token);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        lock(&self.ledger).disconnected = true;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Acks that could not be queued yet, retried in order.
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    queue: VecDeque<AckToken>,
}

impl PendingAcks {
    pub(crate) fn push(&mut self, token: AckToken) {
        self.queue.push_back(token);
    }

    /// Offer queued acks to `send` until it refuses one.
    pub(crate) fn drain_with<E>(
        &mut self,
        mut send: impl FnMut(AckToken) -> Result<(), E>,
    ) -> Result<(), E> {
        while let Some(token) = self.queue.front().copied() {
            send(token)?;
            self.queue.pop_front();
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
