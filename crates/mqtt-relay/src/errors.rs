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

// src/errors.rs
// Error types for every stage of the relay: the upstream transport, the
// registry's subscribe phases, per-message processing, the downstream queue,
// storage and the ingestor.

use thiserror::Error;

// TransportError covers everything that can go wrong talking to an
// upstream broker (connect, subscribe, unsubscribe).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no brokers were provided")]
    NoBrokers,

    #[error("invalid broker address '{broker}': {reason}")]
    InvalidBroker { broker: String, reason: String },

    #[error("broker {broker} refused the connection: {code}")]
    ConnectionRefused { broker: String, code: String },

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    #[error("broker rejected subscription to {topics:?}")]
    SubscriptionRejected { topics: Vec<String> },

    #[error("all brokers failed: {}", .attempts.join("; "))]
    AllBrokersFailed { attempts: Vec<String> },

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

impl TransportError {
    // is_timeout checks if the operation gave up waiting on the broker.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    // is_rejection checks if the broker answered, but said no.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::SubscriptionRejected { .. }
        )
    }
}

// SubscribePhase names which part of Registry::subscribe failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribePhase {
    Validate,
    Connect,
    Subscribe,
}

impl std::fmt::Display for SubscribePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validate => write!(f, "validate"),
            Self::Connect => write!(f, "connect"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}

// SubscribeError is what Registry::subscribe hands back to its caller. No
// session is installed when one of these is returned.
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("client id must not be empty")]
    InvalidClientId,

    #[error("client [{client_id}] connect failed: {source}")]
    Connect {
        client_id: String,
        #[source]
        source: TransportError,
    },

    #[error("client [{client_id}] subscribe failed: {source}")]
    Subscribe {
        client_id: String,
        #[source]
        source: TransportError,
    },
}

impl SubscribeError {
    pub fn phase(&self) -> SubscribePhase {
        match self {
            Self::InvalidClientId => SubscribePhase::Validate,
            Self::Connect { .. } => SubscribePhase::Connect,
            Self::Subscribe { .. } => SubscribePhase::Subscribe,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Subscribe { .. })
    }
}

// ProcessingError is a failure of one processor invocation for one message.
// It never leaves the dispatch loop.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("failed to publish relay record: {0}")]
    Publish(#[from] QueueError),

    #[error("processor failed: {0}")]
    Failed(String),
}

impl ProcessingError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

// QueueError is returned by the downstream queue, local or AMQP.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no queue bound to routing key '{0}'")]
    UnknownRoute(String),

    #[error("queue consumer has gone away")]
    Closed,

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("AMQP broker did not confirm the record")]
    Rejected,
}

// StoreError covers the relational store behind client definitions and
// persisted messages.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error in query '{query}': {source}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("database connection error: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid stored client payload for [{client_id}]: {source}")]
    InvalidPayload {
        client_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid client definition: {0}")]
    InvalidDefinition(String),

    #[error("persistence failed: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn query(query: &'static str, source: sqlx::Error) -> Self {
        Self::Query { query, source }
    }
}

// ReplayError is why one stored client could not be brought back at startup.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("stored definition is unusable: {0}")]
    Definition(#[from] StoreError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

// IngestError ends the ingestor. Only raised for malformed records when
// the ingestor is configured to halt on them.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed relay record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_categories() {
        assert!(TransportError::Timeout { operation: "SUBACK" }.is_timeout());
        assert!(!TransportError::Closed.is_timeout());
        assert!(
            TransportError::ConnectionRefused {
                broker: "tcp://b:1883".to_string(),
                code: "NotAuthorized".to_string(),
            }
            .is_rejection()
        );
        assert!(!TransportError::NoBrokers.is_rejection());
    }

    #[test]
    fn test_subscribe_error_names_its_phase() {
        let error = SubscribeError::Subscribe {
            client_id: "c1".to_string(),
            source: TransportError::SubscriptionRejected {
                topics: vec!["a".to_string()],
            },
        };
        assert_eq!(error.phase(), SubscribePhase::Subscribe);
        assert!(error.is_connection_error());
        assert_eq!(
            error.to_string(),
            r#"client [c1] subscribe failed: broker rejected subscription to ["a"]"#
        );

        assert_eq!(SubscribeError::InvalidClientId.phase().to_string(), "validate");
        assert!(!SubscribeError::InvalidClientId.is_connection_error());
    }

    #[test]
    fn test_all_brokers_failed_lists_attempts() {
        let error = TransportError::AllBrokersFailed {
            attempts: vec!["a: refused".to_string(), "b: timed out".to_string()],
        };
        assert_eq!(error.to_string(), "all brokers failed: a: refused; b: timed out");
    }

    #[test]
    fn test_queue_error_converts_to_processing_error() {
        let error: ProcessingError = QueueError::Closed.into();
        assert!(matches!(error, ProcessingError::Publish(QueueError::Closed)));
    }
}
