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

// src/lib.rs
// mqtt-relay keeps one upstream MQTT session per logical client and relays
// everything those sessions receive, through a queue, into storage.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod ingest;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod session;
pub mod shutdown_handle;
pub mod stats;
pub mod store;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

pub use rumqttc::QoS;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiState;
use crate::config::{Config, ConfigError};
use crate::errors::{QueueError, StoreError};
use crate::ingest::Ingestor;
use crate::processor::SharedProcessor;
use crate::queue::{AmqpQueue, LocalQueue, RecordStream, SharedPublisher};
use crate::registry::Registry;
use crate::relay::RelaySink;
use crate::replay::replay_clients;
use crate::shutdown_handle::ShutdownHandle;
use crate::store::{MemoryStore, PgStore, Stores};
use crate::transport::{Connector, MqttConnector};

/// Run mqtt-relay in the background against real MQTT brokers. See [`spawn_with_connector`].
pub async fn spawn(config: Config) -> Result<SpawnHandle, SpawnError> {
    let connector = Arc::new(MqttConnector::new(config.mqtt_settings()));
    spawn_with_connector(config, connector).await
}

/// Run mqtt-relay in the background, returning a [`SpawnHandle`] once the HTTP API is listening and
/// stored clients have been replayed. When the handle is dropped, the service shuts down.
pub async fn spawn_with_connector(
    config: Config,
    connector: Arc<dyn Connector>,
) -> Result<SpawnHandle, SpawnError> {
    config.validate()?;

    // 1) Storage
    let stores = match &config.database_url {
        Some(database_url) => {
            let store = PgStore::connect(database_url, config.database_max_connections).await?;
            store.migrate().await?;
            tracing::info!("using postgres storage");
            Stores::from_backend(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "no database_url configured, client definitions and messages are kept in memory"
            );
            Stores::from_backend(Arc::new(MemoryStore::new()))
        }
    };

    // 2) Queue and its single consumer
    let (publisher, consumer, amqp): (SharedPublisher, RecordStream, Option<AmqpQueue>) =
        match &config.amqp_url {
            Some(amqp_url) => {
                let queue = AmqpQueue::connect(amqp_url, config.routing_key.clone()).await?;
                let publisher = queue.publisher().await?;
                let consumer = queue.consumer(config.amqp_prefetch()).await?;
                (
                    Arc::new(publisher) as SharedPublisher,
                    Box::pin(consumer) as RecordStream,
                    Some(queue),
                )
            }
            None => {
                tracing::warn!("no amqp_url configured, queued messages are lost on restart");
                let (publisher, consumer) =
                    LocalQueue::new(config.routing_key.clone(), config.queue_capacity);
                (
                    Arc::new(publisher) as SharedPublisher,
                    Box::pin(consumer) as RecordStream,
                    None,
                )
            }
        };
    let ingestor = Ingestor::new(stores.messages.clone(), config.ingestor_settings());
    let ingest_stats = ingestor.stats();
    let ingest_shutdown = CancellationToken::new();
    let ingest_handle = ingestor.spawn(consumer, ingest_shutdown.clone());

    // 3) Registry, relaying everything into the queue
    let registry = Arc::new(Registry::new(connector, config.registry_settings()));
    let processor: SharedProcessor =
        Arc::new(RelaySink::new(publisher, config.routing_key.clone()));

    // 4) Bring stored clients back
    if config.replay_on_startup {
        if let Err(error) =
            replay_clients(stores.clients.as_ref(), &registry, processor.clone()).await
        {
            tracing::error!(%error, "could not load stored clients, continuing without replay");
        }
    }

    // 5) HTTP API
    let listener = TcpListener::bind(config.listen_address)
        .await
        .map_err(SpawnError::Listen)?;
    let local_addr = listener.local_addr().map_err(SpawnError::Listen)?;
    tracing::info!("HTTP API listening on {local_addr}");
    let api_handle = api::spawn(
        listener,
        ApiState {
            registry: registry.clone(),
            clients: stores.clients.clone(),
            processor: processor.clone(),
            ingest_stats,
        },
    );

    // 6) Wait for a shutdown signal, then stop in order: HTTP, sessions, ingestor.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let drain_timeout = config.drain_timeout;
    let join_handle = tokio::spawn({
        let registry = registry.clone();
        async move {
            shutdown_rx.await.ok();
            tracing::info!("shutting down");
            if let Err(error) = api_handle.shutdown_and_wait().await {
                tracing::error!(%error, "HTTP server task panicked");
            }
            registry.shutdown().await;

            // With every session gone, this was the last publisher: a local queue ends once
            // the ingestor has drained it. A durable AMQP queue keeps what is left for the next
            // run, so the ingestor only finishes the writes it already has.
            std::mem::drop(processor);
            if amqp.is_some() {
                ingest_shutdown.cancel();
            }
            let mut ingest_handle = ingest_handle;
            let outcome = match tokio::time::timeout(drain_timeout, &mut ingest_handle).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("ingestor did not drain in time, stopping it");
                    ingest_shutdown.cancel();
                    ingest_handle.await
                }
            };
            match outcome {
                Ok(Ok(stats)) => tracing::info!(?stats, "ingestor finished"),
                Ok(Err(error)) => tracing::error!(%error, "ingestor stopped with an error"),
                Err(error) => tracing::error!(%error, "ingestor task panicked"),
            }
            if let Some(queue) = amqp {
                queue.close().await;
            }
        }
    });

    Ok(SpawnHandle {
        shutdown_tx,
        join_handle,
        local_addr,
        registry,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Error setting up storage: {0}")]
    Store(#[from] StoreError),
    #[error("Error setting up the queue: {0}")]
    Queue(#[from] QueueError),
    #[error("Error listening on HTTP address: {0}")]
    Listen(std::io::Error),
}

pub struct SpawnHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
}

impl SpawnHandle {
    /// The address the HTTP API actually bound to (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

impl ShutdownHandle<()> for SpawnHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}
