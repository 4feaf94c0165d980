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

// src/replay.rs
// Startup replay: bring every stored, non-stopped client back online.

use futures_util::future::join_all;

use crate::errors::{ReplayError, StoreError};
use crate::processor::SharedProcessor;
use crate::registry::Registry;
use crate::store::{ClientStore, StoredClient};

// ReplaySummary reports how a replay went. One client failing never stops
// the others from being replayed.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub restored: Vec<String>,
    pub failed: Vec<(String, ReplayError)>,
}

pub async fn replay_clients(
    store: &dyn ClientStore,
    registry: &Registry,
    processor: SharedProcessor,
) -> Result<ReplaySummary, StoreError> {
    let clients = store.active_clients().await?;
    tracing::info!(count = clients.len(), "replaying stored clients");

    let results = join_all(clients.into_iter().map(|client| {
        let processor = processor.clone();
        async move {
            let client_id = client.client_id.clone();
            (client_id, replay_one(registry, client, processor).await)
        }
    }))
    .await;

    let mut summary = ReplaySummary::default();
    for (client_id, result) in results {
        match result {
            Ok(()) => summary.restored.push(client_id),
            Err(error) => {
                tracing::warn!(client_id = %client_id, %error, "failed to restore client");
                summary.failed.push((client_id, error));
            }
        }
    }
    tracing::info!(
        restored = summary.restored.len(),
        failed = summary.failed.len(),
        "replay finished"
    );
    Ok(summary)
}

async fn replay_one(
    registry: &Registry,
    client: StoredClient,
    processor: SharedProcessor,
) -> Result<(), ReplayError> {
    let topics = client.definition.topic_map()?;
    registry
        .subscribe(
            &client.client_id,
            client.definition.credentials(),
            client.definition.broker_set(),
            topics,
            processor,
        )
        .await?;
    Ok(())
}
