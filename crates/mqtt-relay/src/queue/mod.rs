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

// src/queue/mod.rs
// The downstream FIFO between relay sinks and the ingestor. Publishers are
// shared by every session; there is exactly one consumer. LocalQueue keeps
// it in-process, AmqpQueue puts it on a RabbitMQ broker.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::QueueError;

pub mod amqp;

pub use amqp::{AmqpPublisher, AmqpQueue};

// QueuePublisher puts an already-serialized record on a named queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync + 'static {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), QueueError>;
}

pub type SharedPublisher = Arc<dyn QueuePublisher>;

/// The consuming side of a queue, as handed to the ingestor.
pub type RecordStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

// LocalQueue is a bounded in-process queue bound to a single routing key.
pub struct LocalQueue;

impl LocalQueue {
    // new returns the publishing half and the consuming stream. The stream
    // ends once every publisher is dropped.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        routing_key: impl Into<String>,
        capacity: usize,
    ) -> (LocalQueuePublisher, ReceiverStream<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            LocalQueuePublisher {
                routing_key: routing_key.into(),
                tx,
            },
            ReceiverStream::new(rx),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LocalQueuePublisher {
    routing_key: String,
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl QueuePublisher for LocalQueuePublisher {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), QueueError> {
        if routing_key != self.routing_key {
            return Err(QueueError::UnknownRoute(routing_key.to_string()));
        }
        self.tx.send(body).await.map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let (publisher, consumer) = LocalQueue::new("messages", 4);
        publisher.publish("messages", b"1".to_vec()).await.unwrap();
        publisher.publish("messages", b"2".to_vec()).await.unwrap();
        drop(publisher);

        let bodies: Vec<Vec<u8>> = consumer.collect().await;
        assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_route_fails() {
        let (publisher, _consumer) = LocalQueue::new("messages", 4);
        assert!(matches!(
            publisher.publish("other", b"x".to_vec()).await,
            Err(QueueError::UnknownRoute(route)) if route == "other"
        ));
    }

    #[tokio::test]
    async fn test_publish_after_consumer_dropped_fails() {
        let (publisher, consumer) = LocalQueue::new("messages", 4);
        drop(consumer);
        assert!(matches!(
            publisher.publish("messages", b"x".to_vec()).await,
            Err(QueueError::Closed)
        ));
    }
}
