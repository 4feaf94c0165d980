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

// src/transport/loopback.rs
// An in-process broker. Sessions connect to it through the normal
// Connector/Transport seam, so the registry and dispatch loop run unchanged
// against it. Used by the integration tests and by `run --loopback`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;

use crate::errors::TransportError;
use crate::session::TopicMap;
use crate::transport::topic::{filter_regex, parse_broker};
use crate::transport::{ConnectRequest, Connector, Delivery, Transport};

// BrokerEvent is one observable thing a client did to the broker, recorded
// in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { client_id: String },
    Subscribed { client_id: String, topics: Vec<String> },
    Unsubscribed { client_id: String, topics: Vec<String> },
    Disconnected { client_id: String },
}

#[derive(Debug)]
struct LiveConnection {
    client_id: String,
    // filters maps each subscribed filter to its compiled form.
    filters: BTreeMap<String, Regex>,
    delivery: Delivery,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_connection_id: u64,
    connections: HashMap<u64, LiveConnection>,
    events: Vec<BrokerEvent>,
    refuse_connections: HashSet<String>,
    refuse_subscriptions: HashSet<String>,
}

// LoopbackBroker is cheap to clone; clones share the same broker.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // publish hands a message to every live connection with a matching
    // filter, returning how many connections it was handed to. Like a real
    // broker connection, it waits while a subscriber's inbox is full.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let targets: Vec<Delivery> = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .connections
                .values()
                .filter(|conn| conn.filters.values().any(|filter| filter.is_match(topic)))
                .map(|conn| conn.delivery.clone())
                .collect()
        };

        for delivery in &targets {
            delivery.deliver(topic, payload.clone()).await;
        }
        targets.len()
    }

    // refuse_connections_for makes every connect for this client id fail
    // with a CONNACK refusal until allow_all is called.
    pub fn refuse_connections_for(&self, client_id: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.refuse_connections.insert(client_id.to_string());
    }

    // refuse_subscriptions_for makes every subscribe for this client id
    // come back with a failure SUBACK.
    pub fn refuse_subscriptions_for(&self, client_id: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.refuse_subscriptions.insert(client_id.to_string());
    }

    pub fn allow_all(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.refuse_connections.clear();
        state.refuse_subscriptions.clear();
    }

    // connection_count is the number of live connections across all clients.
    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").connections.len()
    }

    // connections_for is the number of live connections for one client id.
    pub fn connections_for(&self, client_id: &str) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .connections
            .values()
            .filter(|conn| conn.client_id == client_id)
            .count()
    }

    // subscriptions_for lists the filters held by a client's live
    // connections.
    pub fn subscriptions_for(&self, client_id: &str) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        let mut filters: Vec<String> = state
            .connections
            .values()
            .filter(|conn| conn.client_id == client_id)
            .flat_map(|conn| conn.filters.keys().cloned())
            .collect();
        filters.sort();
        filters
    }

    pub fn disconnect_count(&self, client_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, BrokerEvent::Disconnected { client_id: id } if id == client_id)
            })
            .count()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().expect("lock poisoned").events.clone()
    }
}

impl Connector for LoopbackBroker {
    fn transport(&self, request: ConnectRequest, delivery: Delivery) -> Box<dyn Transport> {
        Box::new(LoopbackTransport {
            broker: self.clone(),
            request,
            delivery,
            connection_id: None,
        })
    }
}

struct LoopbackTransport {
    broker: LoopbackBroker,
    request: ConnectRequest,
    delivery: Delivery,
    connection_id: Option<u64>,
}

impl LoopbackTransport {
    fn connection_id(&self) -> Result<u64, TransportError> {
        self.connection_id.ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection_id.is_some() {
            return Ok(());
        }
        let first_broker = self
            .request
            .brokers
            .iter()
            .next()
            .ok_or(TransportError::NoBrokers)?;
        for broker in &self.request.brokers {
            parse_broker(broker)?;
        }

        let client_id = self.request.client_id.clone();
        let mut state = self.broker.state.lock().expect("lock poisoned");
        if state.refuse_connections.contains(&client_id) {
            return Err(TransportError::ConnectionRefused {
                broker: first_broker.clone(),
                code: "NotAuthorized".to_string(),
            });
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(
            id,
            LiveConnection {
                client_id: client_id.clone(),
                filters: BTreeMap::new(),
                delivery: self.delivery.clone(),
            },
        );
        state.events.push(BrokerEvent::Connected { client_id });
        self.connection_id = Some(id);
        Ok(())
    }

    async fn subscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError> {
        let id = self.connection_id()?;
        if topics.is_empty() {
            return Ok(());
        }
        let client_id = self.request.client_id.clone();
        let names: Vec<String> = topics.keys().cloned().collect();
        let compiled = topics
            .keys()
            .map(|topic| filter_regex(topic).map(|filter| (topic.clone(), filter)))
            .collect::<Result<Vec<_>, TransportError>>()?;

        let mut state = self.broker.state.lock().expect("lock poisoned");
        if state.refuse_subscriptions.contains(&client_id) {
            return Err(TransportError::SubscriptionRejected { topics: names });
        }
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        conn.filters.extend(compiled);
        state.events.push(BrokerEvent::Subscribed {
            client_id,
            topics: names,
        });
        Ok(())
    }

    async fn unsubscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError> {
        let id = self.connection_id()?;
        if topics.is_empty() {
            return Ok(());
        }
        let client_id = self.request.client_id.clone();
        let mut state = self.broker.state.lock().expect("lock poisoned");
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        for topic in topics.keys() {
            conn.filters.remove(topic);
        }
        state.events.push(BrokerEvent::Unsubscribed {
            client_id,
            topics: topics.keys().cloned().collect(),
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(id) = self.connection_id.take() else {
            return Ok(());
        };
        let mut state = self.broker.state.lock().expect("lock poisoned");
        if state.connections.remove(&id).is_some() {
            state.events.push(BrokerEvent::Disconnected {
                client_id: self.request.client_id.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{BrokerSet, Credentials};
    use crate::stats::SessionStatsTracker;

    fn request(client_id: &str) -> ConnectRequest {
        ConnectRequest {
            client_id: client_id.to_string(),
            credentials: Credentials::default(),
            brokers: BrokerSet::from(["tcp://loopback:1883".to_string()]),
        }
    }

    fn topics(names: &[&str]) -> TopicMap {
        names
            .iter()
            .map(|name| (name.to_string(), rumqttc::QoS::AtLeastOnce))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber_only() {
        let broker = LoopbackBroker::new();
        let (tx, mut rx) = mpsc::channel(8);
        let delivery = Delivery::new("c1", tx, Arc::new(SessionStatsTracker::new()));
        let mut transport = broker.transport(request("c1"), delivery);

        transport.connect().await.unwrap();
        transport
            .subscribe_all(&topics(&["sensors/+/temp"]))
            .await
            .unwrap();

        assert_eq!(broker.publish("sensors/a/temp", "21").await, 1);
        assert_eq!(broker.publish("sensors/a/humidity", "40").await, 0);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "sensors/a/temp");
        assert_eq!(message.payload, Bytes::from("21"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = LoopbackBroker::new();
        let (tx, _rx) = mpsc::channel(8);
        let delivery = Delivery::new("c1", tx, Arc::new(SessionStatsTracker::new()));
        let mut transport = broker.transport(request("c1"), delivery);

        transport.connect().await.unwrap();
        assert_eq!(broker.connections_for("c1"), 1);
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();

        assert_eq!(broker.connections_for("c1"), 0);
        assert_eq!(broker.disconnect_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let broker = LoopbackBroker::new();
        broker.refuse_connections_for("bad");
        broker.refuse_subscriptions_for("picky");

        let (tx, _rx) = mpsc::channel(8);
        let stats = Arc::new(SessionStatsTracker::new());
        let mut bad = broker.transport(request("bad"), Delivery::new("bad", tx.clone(), stats.clone()));
        let err = bad.connect().await.unwrap_err();
        assert!(err.is_rejection());

        let mut picky = broker.transport(request("picky"), Delivery::new("picky", tx, stats));
        picky.connect().await.unwrap();
        let err = picky.subscribe_all(&topics(&["a"])).await.unwrap_err();
        assert!(matches!(err, TransportError::SubscriptionRejected { topics } if topics == vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected() {
        let broker = LoopbackBroker::new();
        let (tx, _rx) = mpsc::channel(8);
        let delivery = Delivery::new("c1", tx, Arc::new(SessionStatsTracker::new()));
        let mut transport = broker.transport(request("c1"), delivery);

        transport.connect().await.unwrap();
        assert!(matches!(
            transport.subscribe_all(&topics(&["a/#/b"])).await,
            Err(TransportError::InvalidFilter { .. })
        ));
        assert!(broker.subscriptions_for("c1").is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_brokers() {
        let broker = LoopbackBroker::new();
        let (tx, _rx) = mpsc::channel(8);
        let delivery = Delivery::new("c1", tx, Arc::new(SessionStatsTracker::new()));
        let mut req = request("c1");
        req.brokers.clear();
        let mut transport = broker.transport(req, delivery);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::NoBrokers)
        ));
    }
}
