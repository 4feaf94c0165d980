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

// src/transport/mod.rs
// The upstream side of a session: one connection to a broker, owned by one
// session, plus the callback that feeds that session's inbox.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::session::{BrokerSet, Credentials, InboundMessage, TopicMap};
use crate::stats::SessionStatsTracker;

pub mod loopback;
pub mod mqtt;
pub mod topic;

pub use loopback::{BrokerEvent, LoopbackBroker};
pub use mqtt::{MqttConnector, MqttSettings};

// Transport is a single upstream connection. The dispatch loop owns it and
// calls disconnect exactly once during teardown; implementations still
// treat a second disconnect as a no-op.
#[async_trait]
pub trait Transport: Send {
    // connect opens the connection, trying brokers until one accepts.
    async fn connect(&mut self) -> Result<(), TransportError>;

    // subscribe_all requests every topic in one round trip and waits for
    // the broker to confirm all of them.
    async fn subscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError>;

    // unsubscribe_all is best-effort; callers log failures and move on.
    async fn unsubscribe_all(&mut self, topics: &TopicMap) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

// ConnectRequest carries everything a Connector needs to build a transport
// for one session.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub credentials: Credentials,
    pub brokers: BrokerSet,
}

// Connector builds transports. The registry holds one and asks it for a
// fresh transport on every subscribe.
pub trait Connector: Send + Sync + 'static {
    fn transport(&self, request: ConnectRequest, delivery: Delivery) -> Box<dyn Transport>;
}

// Delivery is the callback a transport invokes once per inbound PUBLISH.
// It waits for room in a full inbox, so nothing is lost while the session
// is running. A closed inbox (the session is draining) discards the message.
#[derive(Debug, Clone)]
pub struct Delivery {
    client_id: Arc<str>,
    inbox: mpsc::Sender<InboundMessage>,
    stats: Arc<SessionStatsTracker>,
}

impl Delivery {
    pub fn new(
        client_id: &str,
        inbox: mpsc::Sender<InboundMessage>,
        stats: Arc<SessionStatsTracker>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            inbox,
            stats,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn stats(&self) -> &Arc<SessionStatsTracker> {
        &self.stats
    }

    pub async fn deliver(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        let message = InboundMessage::new(topic, payload);
        match self.inbox.send(message).await {
            Ok(()) => self.stats.increment_received(),
            Err(mpsc::error::SendError(message)) => {
                self.stats.increment_discarded();
                tracing::trace!(
                    client_id = %self.client_id,
                    topic = %message.topic,
                    "session draining, discarding message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn test_full_inbox_holds_delivery_back() {
        let stats = Arc::new(SessionStatsTracker::new());
        let (tx, mut rx) = mpsc::channel(1);
        let delivery = Delivery::new("c1", tx, stats.clone());

        delivery.deliver("t", "one").await;
        let blocked = tokio::spawn({
            let delivery = delivery.clone();
            async move { delivery.deliver("t", "two").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(stats.to_stats().total_received, 1);

        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from("one"));
        blocked.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from("two"));
        assert_eq!(stats.to_stats().total_received, 2);
    }

    #[tokio::test]
    async fn test_closed_inbox_discards() {
        let stats = Arc::new(SessionStatsTracker::new());
        let (tx, mut rx) = mpsc::channel(1);
        let delivery = Delivery::new("c1", tx, stats.clone());

        delivery.deliver("t", "one").await;
        // A delivery parked on the full inbox is released by close.
        let blocked = tokio::spawn({
            let delivery = delivery.clone();
            async move { delivery.deliver("t", "two").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        rx.close();
        blocked.await.unwrap();
        delivery.deliver("t", "three").await;

        let snapshot = stats.to_stats();
        assert_eq!(snapshot.total_received, 1);
        assert_eq!(snapshot.total_discarded, 2);
    }
}
