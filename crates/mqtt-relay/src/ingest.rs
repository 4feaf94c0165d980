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

//! The ingestor: the single consumer of the downstream queue. Every record
//! is decoded and persisted in its own task so a slow write never holds up
//! the queue.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::errors::IngestError;
use crate::relay::RelayRecord;
use crate::stats::{IngestStats, IngestStatsTracker};
use crate::store::MessageStore;

/// What to do with a record that does not decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRecordPolicy {
    /// Log it, count it and keep consuming.
    #[default]
    Skip,
    /// Stop the ingestor with [`IngestError::MalformedRecord`].
    Halt,
}

#[derive(Debug, Clone)]
pub struct IngestorSettings {
    pub malformed_record_policy: MalformedRecordPolicy,
    pub max_concurrent_persists: usize,
    pub persist_timeout: Duration,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            malformed_record_policy: MalformedRecordPolicy::Skip,
            max_concurrent_persists: 32,
            persist_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn MessageStore>,
    settings: IngestorSettings,
    stats: Arc<IngestStatsTracker>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn MessageStore>, settings: IngestorSettings) -> Self {
        Self {
            store,
            settings,
            stats: Arc::new(IngestStatsTracker::new()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStatsTracker> {
        self.stats.clone()
    }

    pub fn spawn<S>(
        self,
        records: S,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<IngestStats, IngestError>>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        tokio::spawn(self.run(records, shutdown))
    }

    /// Consume `records` until the stream ends or `shutdown` fires, then wait
    /// for outstanding writes. Only returns an error when a malformed record
    /// is met under [`MalformedRecordPolicy::Halt`].
    pub async fn run<S>(
        self,
        records: S,
        shutdown: CancellationToken,
    ) -> Result<IngestStats, IngestError>
    where
        S: Stream<Item = Vec<u8>> + Send,
    {
        let mut records = pin!(records);
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_persists.max(1)));
        let mut tasks = JoinSet::new();
        tracing::info!(policy = ?self.settings.malformed_record_policy, "ingestor started");

        let outcome = loop {
            let body = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Ok(()),

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                    continue;
                }

                body = records.next() => match body {
                    Some(body) => body,
                    None => break Ok(()),
                },
            };
            self.stats.increment_received();

            let record: RelayRecord = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(error) => {
                    self.stats.increment_malformed();
                    match self.settings.malformed_record_policy {
                        MalformedRecordPolicy::Skip => {
                            tracing::warn!(%error, bytes = body.len(), "skipping malformed relay record");
                            continue;
                        }
                        MalformedRecordPolicy::Halt => {
                            tracing::error!(%error, bytes = body.len(), "malformed relay record, halting ingestor");
                            break Err(IngestError::MalformedRecord(error));
                        }
                    }
                }
            };

            // The semaphore is never closed.
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break Ok(());
            };
            tasks.spawn(persist_one(
                self.store.clone(),
                record,
                self.settings.persist_timeout,
                self.stats.clone(),
                permit,
            ));
        };

        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }

        let stats = self.stats.to_stats();
        tracing::info!(?stats, "ingestor stopped");
        outcome.map(|()| stats)
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(error) = joined {
            self.stats.increment_failed();
            tracing::error!(%error, "persist task failed");
        }
    }
}

async fn persist_one(
    store: Arc<dyn MessageStore>,
    record: RelayRecord,
    timeout: Duration,
    stats: Arc<IngestStatsTracker>,
    _permit: OwnedSemaphorePermit,
) {
    match tokio::time::timeout(timeout, store.persist(&record)).await {
        Ok(Ok(())) => {
            stats.increment_persisted();
            tracing::debug!(record_id = %record.id, client_id = %record.client_id, "persisted record");
        }
        Ok(Err(error)) => {
            stats.increment_failed();
            tracing::warn!(
                record_id = %record.id,
                client_id = %record.client_id,
                %error,
                "failed to persist record"
            );
        }
        Err(_) => {
            stats.increment_failed();
            tracing::warn!(
                record_id = %record.id,
                client_id = %record.client_id,
                "timed out persisting record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InboundMessage;
    use crate::store::MemoryStore;

    fn encoded(client_id: &str, topic: &str, payload: &str) -> Vec<u8> {
        serde_json::to_vec(&RelayRecord::new(
            client_id,
            InboundMessage::new(topic, payload.to_string()),
        ))
        .unwrap()
    }

    fn ingestor(store: &MemoryStore, policy: MalformedRecordPolicy) -> Ingestor {
        Ingestor::new(
            Arc::new(store.clone()),
            IngestorSettings {
                malformed_record_policy: policy,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_skip_policy_persists_good_records() {
        let store = MemoryStore::new();
        let records = tokio_stream::iter(vec![
            encoded("c1", "a", "1"),
            b"not json".to_vec(),
            encoded("c2", "b", "2"),
        ]);

        let stats = ingestor(&store, MalformedRecordPolicy::Skip)
            .run(records, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            stats,
            IngestStats {
                total_received: 3,
                total_malformed: 1,
                total_persisted: 2,
                total_failed: 0,
            }
        );
        let mut clients: Vec<String> = store
            .messages()
            .into_iter()
            .map(|record| record.client_id)
            .collect();
        clients.sort();
        assert_eq!(clients, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_halt_policy_stops_with_error() {
        let store = MemoryStore::new();
        let records = tokio_stream::iter(vec![
            encoded("c1", "a", "1"),
            b"{".to_vec(),
            encoded("c2", "b", "2"),
        ]);

        let result = ingestor(&store, MalformedRecordPolicy::Halt)
            .run(records, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(IngestError::MalformedRecord(_))));
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failures_do_not_stop_ingestion() {
        let store = MemoryStore::new();
        store.fail_persist(true);
        let records = tokio_stream::iter(vec![encoded("c1", "a", "1"), encoded("c1", "a", "2")]);

        let stats = ingestor(&store, MalformedRecordPolicy::Skip)
            .run(records, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.total_received, 2);
        assert_eq!(stats.total_failed, 2);
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_an_idle_ingestor() {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let handle = ingestor(&store, MalformedRecordPolicy::Skip)
            .spawn(tokio_stream::pending::<Vec<u8>>(), shutdown.clone());

        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.total_received, 0);
    }
}
