// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT bus (rumqttc)
//!
//! Manual acknowledgements: a QoS 1/2 delivery is acked only when the
//! bridge says so, so a crash before handoff leaves it with the broker.
//! Subscriptions are (re)issued on every `ConnAck`.

use super::{AckToken, BusMessage, MessageBus, PendingAcks, TransportError};
use crate::config::BusConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, SubscribeReasonCode,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// MQTT client driven by [`MessageBus::recv`].
pub struct MqttBus {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Vec<String>,
    qos: QoS,
    pending_acks: PendingAcks,
}

impl MqttBus {
    /// Build the client. No I/O happens until the first `recv`.
    pub fn new(config: &BusConfig) -> Result<Self, TransportError> {
        let qos = qos_from_level(config.qos)
            .ok_or_else(|| TransportError::Subscribe(format!("invalid qos {}", config.qos)))?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(config.clean_session);
        options.set_manual_acks(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));

        Ok(Self {
            client,
            eventloop,
            topics: config.topics.clone(),
            qos,
            pending_acks: PendingAcks::default(),
        })
    }

    fn subscribe_all(&self) {
        for topic in &self.topics {
            match self.client.try_subscribe(topic, self.qos) {
                Ok(()) => debug!(topic = %topic, "Subscribing"),
                Err(e) => warn!(topic = %topic, "Failed to queue subscription: {}", e),
            }
        }
    }

    fn flush_acks(&mut self) {
        let client = &self.client;
        let result = self.pending_acks.drain_with(|token| {
            let qos = qos_from_level(token.qos).unwrap_or(QoS::AtLeastOnce);
            let mut publish = Publish::new("", qos, Vec::<u8>::new());
            publish.pkid = token.pkid;
            client.try_ack(&publish)
        });
        if let Err(e) = result {
            debug!(pending = self.pending_acks.len(), "Ack deferred: {}", e);
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn recv(&mut self) -> Result<BusMessage, TransportError> {
        loop {
            self.flush_acks();

            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            match event {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(BusMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        ack: AckToken {
                            pkid: publish.pkid,
                            qos: publish.qos as u8,
                        },
                    });
                }
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!(
                        session_present = ack.session_present,
                        topics = self.topics.len(),
                        "Connected to MQTT broker"
                    );
                    self.subscribe_all();
                }
                Event::Incoming(Packet::SubAck(suback)) => {
                    let rejected = suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count();
                    if rejected > 0 {
                        return Err(TransportError::Subscribe(format!(
                            "broker rejected {} of {} subscriptions",
                            rejected,
                            suback.return_codes.len()
                        )));
                    }
                    info!("Subscriptions acknowledged");
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(TransportError::Connection("broker sent disconnect".into()));
                }
                Event::Incoming(_) | Event::Outgoing(_) => {}
            }
        }
    }

    async fn ack(&mut self, token: AckToken) -> Result<(), TransportError> {
        if token.qos > 0 {
            self.pending_acks.push(token);
            self.flush_acks();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.flush_acks();
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        // Drive the event loop so the queued acks and DISCONNECT go out.
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
            warn!("Timed out waiting for MQTT disconnect");
        }
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
