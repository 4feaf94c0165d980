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

//! Persistence: client definitions (for replay after restart) and relayed
//! messages (written by the ingestor).

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::relay::RelayRecord;

pub mod memory;
pub mod migrations;
pub mod model;
pub mod postgres;

pub use memory::MemoryStore;
pub use model::{ClientDefinition, StoredClient, TopicSubscription};
pub use postgres::PgStore;

/// Where relayed messages end up.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn persist(&self, record: &RelayRecord) -> Result<(), StoreError>;
}

/// Client definitions, keyed by client id.
#[async_trait]
pub trait ClientStore: Send + Sync + 'static {
    /// Insert or replace a definition and mark it active.
    async fn save_client(
        &self,
        client_id: &str,
        definition: &ClientDefinition,
    ) -> Result<(), StoreError>;

    /// Mark a client stopped so it is not replayed. Returns false when the
    /// client was never saved.
    async fn stop_client(&self, client_id: &str) -> Result<bool, StoreError>;

    /// Every client not marked stopped, ordered by client id.
    async fn active_clients(&self) -> Result<Vec<StoredClient>, StoreError>;
}

/// Both halves of one backend, as handed to the service.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub clients: Arc<dyn ClientStore>,
}

impl Stores {
    pub fn from_backend<T: MessageStore + ClientStore>(backend: Arc<T>) -> Self {
        Self {
            messages: backend.clone(),
            clients: backend,
        }
    }
}
