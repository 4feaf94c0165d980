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

// tests/util/mod.rs
// Shared helpers for the integration tests: a registry wired to the loopback
// broker, a processor that records what it sees, and a polling helper.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mqtt_relay::QoS;
use mqtt_relay::processor::{SharedProcessor, processor_fn};
use mqtt_relay::registry::{Registry, RegistrySettings};
use mqtt_relay::session::{BrokerSet, InboundMessage, TopicMap};
use mqtt_relay::transport::LoopbackBroker;

pub const BROKER: &str = "tcp://127.0.0.1:1883";

pub struct Harness {
    pub broker: LoopbackBroker,
    pub registry: Arc<Registry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(RegistrySettings {
            drain_timeout: Duration::from_secs(2),
            ..RegistrySettings::default()
        })
    }

    pub fn with_settings(settings: RegistrySettings) -> Self {
        let broker = LoopbackBroker::new();
        let registry = Arc::new(Registry::new(Arc::new(broker.clone()), settings));
        Self { broker, registry }
    }
}

// Seen is one message as observed by a Recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processor(&self) -> SharedProcessor {
        let seen = self.seen.clone();
        processor_fn(move |client_id, message: InboundMessage| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(Seen {
                    client_id,
                    topic: message.topic,
                    payload: message.payload.to_vec(),
                });
                Ok(())
            }
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn count_for(&self, client_id: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| seen.client_id == client_id)
            .count()
    }
}

pub fn brokers(list: &[&str]) -> BrokerSet {
    list.iter().map(|broker| broker.to_string()).collect()
}

pub fn topics(list: &[(&str, QoS)]) -> TopicMap {
    list.iter()
        .map(|(topic, qos)| (topic.to_string(), *qos))
        .collect()
}

/// Poll `condition` until it holds, panicking with `what` after five seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for conditions that have to be awaited.
pub async fn eventually_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
