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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::session::{BrokerSet, Credentials, TopicMap, qos_from_u8};
use crate::transport::topic::filter_regex;

/// A stored client definition: everything needed to re-create its session.
/// This is also the `client` object accepted by the HTTP subscribe call.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDefinition {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topics: Vec<TopicSubscription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

impl fmt::Debug for ClientDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDefinition")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("brokers", &self.brokers)
            .field("topics", &self.topics)
            .finish()
    }
}

impl ClientDefinition {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }

    pub fn broker_set(&self) -> BrokerSet {
        self.brokers.iter().cloned().collect()
    }

    /// Topics with their QoS. A topic listed twice keeps its last QoS.
    pub fn topic_map(&self) -> Result<TopicMap, StoreError> {
        self.topics
            .iter()
            .map(|subscription| {
                if subscription.topic.is_empty() {
                    return Err(StoreError::InvalidDefinition(
                        "topic must not be empty".to_string(),
                    ));
                }
                filter_regex(&subscription.topic)
                    .map_err(|error| StoreError::InvalidDefinition(error.to_string()))?;
                let qos = qos_from_u8(subscription.qos).ok_or_else(|| {
                    StoreError::InvalidDefinition(format!(
                        "invalid qos {} for topic {}",
                        subscription.qos, subscription.topic
                    ))
                })?;
                Ok((subscription.topic.clone(), qos))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.brokers.is_empty() {
            return Err(StoreError::InvalidDefinition(
                "at least one broker is required".to_string(),
            ));
        }
        self.topic_map().map(|_| ())
    }
}

/// A client definition as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClient {
    pub client_id: String,
    pub definition: ClientDefinition,
}
