/*
 * SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

// src/transport/mqtt.rs
// rumqttc-backed transport. Each session gets its own AsyncClient and a
// background task pumping the EventLoop, which is where inbound PUBLISH
// packets are turned into Delivery calls. The pump waits on each delivery,
// so a slow session stops reading from its broker instead of losing messages.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubscribeFilter, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::session::TopicMap;
use crate::transport::topic::{BrokerAddress, parse_broker};
use crate::transport::{ConnectRequest, Connector, Delivery, Transport};

// How long the pump waits before polling again after a connection error.
// rumqttc reconnects on the next poll.
const EVENT_LOOP_RETRY_DELAY: Duration = Duration::from_secs(1);

// MqttSettings are the knobs shared by every connection the connector makes.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    // client_id_prefix starts every MQTT client id sent to a broker.
    pub client_id_prefix: String,
    // connect_timeout bounds each CONNACK and SUBACK wait.
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    // request_capacity sizes rumqttc's outgoing request channel.
    pub request_capacity: usize,
    // disconnect_timeout bounds how long disconnect waits for the pump.
    pub disconnect_timeout: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id_prefix: "mqtt-relay".to_string(),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            request_capacity: 64,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

impl Connector for MqttConnector {
    fn transport(&self, request: ConnectRequest, delivery: Delivery) -> Box<dyn Transport> {
        Box::new(MqttTransport {
            settings: self.settings.clone(),
            request,
            delivery,
            connection: None,
        })
    }
}

// Ack is what the pump forwards back to the transport for requests that
// need confirmation.
#[derive(Debug)]
enum Ack {
    Subscribe(Vec<SubscribeReasonCode>),
    Unsubscribe,
}

struct Connection {
    broker: BrokerAddress,
    client: AsyncClient,
    acks: mpsc::UnboundedReceiver<Ack>,
    stop: CancellationToken,
    pump: JoinHandle<()>,
}

pub struct MqttTransport {
    settings: MqttSettings,
    request: ConnectRequest,
    delivery: Delivery,
    connection: Option<Connection>,
}

impl MqttTransport {
    // mqtt_client_id is unique per connection, so a replacement session
    // never kicks the one it replaces off the broker early.
    fn mqtt_client_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.settings.client_id_prefix,
            self.request.client_id,
            uuid::Uuid::new_v4().simple()
        )
    }

    fn options_for(&self, broker: &BrokerAddress) -> MqttOptions {
        let mut options = MqttOptions::new(self.mqtt_client_id(), broker.host.clone(), broker.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);
        if !self.request.credentials.is_anonymous() {
            options.set_credentials(
                self.request.credentials.username.clone(),
                self.request.credentials.password.clone(),
            );
        }
        if broker.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options
    }

    // connect_to performs one CONNECT/CONNACK exchange and, on success,
    // hands the event loop off to a pump task.
    async fn connect_to(&self, broker: BrokerAddress) -> Result<Connection, TransportError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options_for(&broker), self.settings.request_capacity);

        let connack = tokio::time::timeout(self.settings.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => return Ok(connack),
                    Ok(_) => continue,
                    Err(error) => return Err(error),
                }
            }
        })
        .await;

        match connack {
            Err(_) => return Err(TransportError::Timeout { operation: "CONNACK" }),
            Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                return Err(TransportError::ConnectionRefused {
                    broker: broker.to_string(),
                    code: format!("{code:?}"),
                });
            }
            Ok(Err(error)) => return Err(error.into()),
            Ok(Ok(connack)) if connack.code != ConnectReturnCode::Success => {
                return Err(TransportError::ConnectionRefused {
                    broker: broker.to_string(),
                    code: format!("{:?}", connack.code),
                });
            }
            Ok(Ok(_)) => {}
        }

        let (ack_tx, acks) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            eventloop,
            self.delivery.clone(),
            ack_tx,
            stop.clone(),
        ));

        Ok(Connection {
            broker,
            client,
            acks,
            stop,
            pump,
        })
    }

    fn connection(&mut self) -> Result<&mut Connection, TransportError> {
        self.connection.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }
        if self.request.brokers.is_empty() {
            return Err(TransportError::NoBrokers);
        }

        let mut attempts = Vec::new();
        for broker in self.request.brokers.clone() {
            let address = match parse_broker(&broker) {
                Ok(address) => address,
                Err(error) => {
                    attempts.push(error.to_string());
                    continue;
                }
            };
            match self.connect_to(address).await {
                Ok(connection) => {
                    tracing::info!(
                        client_id = %self.request.client_id,
                        broker = %connection.broker,
                        "connected to broker"
                    );
                    self.connection = Some(connection);
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!(
                        client_id = %self.request.client_id,
                        broker = %broker,
                        %error,
                        "broker connect attempt failed"
                    );
                    attempts.push(format!("{broker}: {error}"));
                }
            }
        }

        Err(TransportError::AllBrokersFailed { attempts })
    }

    async fn subscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError> {
        let timeout = self.settings.connect_timeout;
        let connection = self.connection()?;
        if topics.is_empty() {
            return Ok(());
        }

        let filters = topics
            .iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos));
        connection.client.subscribe_many(filters).await?;

        let codes = tokio::time::timeout(timeout, async {
            loop {
                match connection.acks.recv().await {
                    Some(Ack::Subscribe(codes)) => return Ok(codes),
                    Some(Ack::Unsubscribe) => continue,
                    None => return Err(TransportError::Closed),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout { operation: "SUBACK" })??;

        let rejected: Vec<String> = topics
            .keys()
            .zip(codes.iter())
            .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
            .map(|(topic, _)| topic.clone())
            .collect();
        if !rejected.is_empty() {
            return Err(TransportError::SubscriptionRejected { topics: rejected });
        }
        Ok(())
    }

    async fn unsubscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError> {
        let timeout = self.settings.connect_timeout;
        let connection = self.connection()?;
        // The request channel can fill up while the broker is unreachable.
        tokio::time::timeout(timeout, async {
            for topic in topics.keys() {
                connection.client.unsubscribe(topic.clone()).await?;
            }
            Ok::<_, TransportError>(())
        })
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "UNSUBSCRIBE",
        })?
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let Connection {
            broker,
            client,
            stop,
            mut pump,
            ..
        } = connection;

        let result = client.disconnect().await.map_err(TransportError::from);
        if tokio::time::timeout(self.settings.disconnect_timeout, &mut pump)
            .await
            .is_err()
        {
            tracing::warn!(
                client_id = %self.request.client_id,
                %broker,
                "event loop did not stop after disconnect, cancelling it"
            );
            stop.cancel();
            pump.await.ok();
        }
        tracing::info!(client_id = %self.request.client_id, %broker, "disconnected from broker");
        result
    }
}

// pump_events drives the rumqttc event loop until the client disconnects or
// the stop token fires.
async fn pump_events(
    mut eventloop: EventLoop,
    delivery: Delivery,
    acks: mpsc::UnboundedSender<Ack>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // Not polling while the inbox is full is the backpressure.
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = delivery.deliver(publish.topic, publish.payload) => {}
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(suback))) => {
                        acks.send(Ack::Subscribe(suback.return_codes)).ok();
                    }
                    Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                        acks.send(Ack::Unsubscribe).ok();
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        delivery.stats().increment_event_loop_errors();
                        tracing::warn!(
                            client_id = %delivery.client_id(),
                            %error,
                            "MQTT event loop error"
                        );
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(EVENT_LOOP_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::{BrokerSet, Credentials};
    use crate::stats::SessionStatsTracker;

    fn transport_for(brokers: &[&str]) -> Box<dyn Transport> {
        let connector = MqttConnector::new(MqttSettings {
            connect_timeout: Duration::from_millis(200),
            ..MqttSettings::default()
        });
        let (tx, _rx) = mpsc::channel(1);
        connector.transport(
            ConnectRequest {
                client_id: "c1".to_string(),
                credentials: Credentials::new("user", "pass"),
                brokers: brokers.iter().map(|b| b.to_string()).collect::<BrokerSet>(),
            },
            Delivery::new("c1", tx, Arc::new(SessionStatsTracker::new())),
        )
    }

    #[tokio::test]
    async fn test_connect_without_brokers_fails() {
        let mut transport = transport_for(&[]);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::NoBrokers)
        ));
    }

    #[tokio::test]
    async fn test_connect_reports_every_failed_broker() {
        let mut transport = transport_for(&["ws://nope", "bad:port"]);
        match transport.connect().await {
            Err(TransportError::AllBrokersFailed { attempts }) => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let mut transport = transport_for(&["localhost"]);
        let topics = TopicMap::from([("a".to_string(), rumqttc::QoS::AtMostOnce)]);
        assert!(matches!(
            transport.subscribe_all(&topics).await,
            Err(TransportError::NotConnected)
        ));
        transport.disconnect().await.unwrap();
    }
}
