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

// src/relay.rs
// RelayRecord is the unit that crosses the downstream queue, and RelaySink
// is the processor that produces it.

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::errors::ProcessingError;
use crate::processor::MessageProcessor;
use crate::queue::SharedPublisher;
use crate::session::InboundMessage;

/// One inbound message, tagged with the client that received it. The
/// payload is opaque and travels base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: Uuid,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub topic: String,
    #[serde(serialize_with = "serialize_base64", deserialize_with = "deserialize_base64")]
    pub payload: Bytes,
    #[serde(rename = "createdAt")]
    pub received_at: DateTime<Utc>,
}

impl RelayRecord {
    pub fn new(client_id: &str, message: InboundMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            topic: message.topic,
            payload: message.payload,
            received_at: message.received_at,
        }
    }
}

fn serialize_base64<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(payload))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Publishes every message it is handed to the downstream queue under a
/// fixed routing key. Holds no per-client state, so one sink is shared by
/// every session.
pub struct RelaySink {
    publisher: SharedPublisher,
    routing_key: String,
}

impl RelaySink {
    pub fn new(publisher: SharedPublisher, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl MessageProcessor for RelaySink {
    async fn process(
        &self,
        client_id: &str,
        message: InboundMessage,
    ) -> Result<(), ProcessingError> {
        let record = RelayRecord::new(client_id, message);
        let body = match serde_json::to_vec(&record) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(
                    client_id,
                    topic = %record.topic,
                    %error,
                    "could not serialize relay record, dropping message"
                );
                return Ok(());
            }
        };

        self.publisher.publish(&self.routing_key, body).await?;
        tracing::debug!(client_id, topic = %record.topic, record_id = %record.id, "relayed message");
        Ok(())
    }
}
