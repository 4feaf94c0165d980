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

// src/queue/amqp.rs
// RabbitMQ-backed queue. Records go through the default exchange to a
// durable queue named after the routing key, marked persistent, so whatever
// the ingestor has not taken yet survives a restart of the relay.

use std::fmt::Display;
use std::future::ready;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::errors::QueueError;
use crate::queue::{QueuePublisher, RecordStream};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONSUMER_TAG: &str = "mqtt-relay-ingestor";

/// A connection to the broker plus the durable queue it feeds.
pub struct AmqpQueue {
    connection: Connection,
    routing_key: String,
}

impl AmqpQueue {
    /// Connect and declare the queue.
    pub async fn connect(url: &str, routing_key: impl Into<String>) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let routing_key = routing_key.into();
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &routing_key,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %routing_key, "connected to AMQP broker");
        Ok(Self {
            connection,
            routing_key,
        })
    }

    /// A publisher on its own channel, in confirm mode: `publish` returns
    /// only once the broker has taken the record.
    pub async fn publisher(&self) -> Result<AmqpPublisher, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(AmqpPublisher {
            channel,
            routing_key: self.routing_key.clone(),
        })
    }

    /// The single consumer. At most `prefetch` deliveries are outstanding;
    /// each one is acknowledged as it is handed to the ingestor. The stream
    /// ends when the channel fails or is closed.
    pub async fn consumer(&self, prefetch: u16) -> Result<AmqpConsumer, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let deliveries = channel
            .basic_consume(
                &self.routing_key,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let records = until_first_error(deliveries).filter_map(|delivery| async move {
            if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
                tracing::warn!(%error, "failed to acknowledge AMQP delivery");
            }
            Some(delivery.data)
        });
        Ok(AmqpConsumer {
            _channel: channel,
            records: Box::pin(records),
        })
    }

    /// Close the connection, which ends the consumer stream.
    pub async fn close(&self) {
        if let Err(error) = self.connection.close(200, "shutting down").await {
            tracing::warn!(%error, "failed to close AMQP connection");
        }
    }
}

#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    routing_key: String,
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), QueueError> {
        if routing_key != self.routing_key {
            return Err(QueueError::UnknownRoute(routing_key.to_string()));
        }
        let confirmation = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &body,
                record_properties(),
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(QueueError::Rejected);
        }
        Ok(())
    }
}

/// Relayed records as they come off the broker. Holds on to its channel for
/// as long as the ingestor reads from it.
pub struct AmqpConsumer {
    _channel: Channel,
    records: RecordStream,
}

impl Stream for AmqpConsumer {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        self.records.as_mut().poll_next(cx)
    }
}

fn record_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
}

fn until_first_error<S, T, E>(stream: S) -> impl Stream<Item = T>
where
    S: Stream<Item = Result<T, E>>,
    E: Display,
{
    stream
        .take_while(|item| {
            ready(match item {
                Ok(_) => true,
                Err(error) => {
                    tracing::error!(%error, "AMQP consumer failed, ending record stream");
                    false
                }
            })
        })
        .filter_map(|item| ready(item.ok()))
}
