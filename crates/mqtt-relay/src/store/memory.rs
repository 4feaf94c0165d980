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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::relay::RelayRecord;
use crate::store::{ClientDefinition, ClientStore, MessageStore, StoredClient};

#[derive(Debug, Default)]
struct MemoryState {
    // client id -> (definition, stopped)
    clients: BTreeMap<String, (ClientDefinition, bool)>,
    messages: Vec<RelayRecord>,
    fail_persist: bool,
}

/// In-memory store, used when no database is configured and in tests.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<RelayRecord> {
        self.state.lock().expect("lock poisoned").messages.clone()
    }

    pub fn is_stopped(&self, client_id: &str) -> Option<bool> {
        let state = self.state.lock().expect("lock poisoned");
        state.clients.get(client_id).map(|(_, stopped)| *stopped)
    }

    // fail_persist makes every following persist call fail until reset.
    pub fn fail_persist(&self, fail: bool) {
        self.state.lock().expect("lock poisoned").fail_persist = fail;
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn save_client(
        &self,
        client_id: &str,
        definition: &ClientDefinition,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .clients
            .insert(client_id.to_string(), (definition.clone(), false));
        Ok(())
    }

    async fn stop_client(&self, client_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Ok(match state.clients.get_mut(client_id) {
            Some((_, stopped)) => {
                *stopped = true;
                true
            }
            None => false,
        })
    }

    async fn active_clients(&self) -> Result<Vec<StoredClient>, StoreError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .clients
            .iter()
            .filter(|(_, (_, stopped))| !stopped)
            .map(|(client_id, (definition, _))| StoredClient {
                client_id: client_id.clone(),
                definition: definition.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist(&self, record: &RelayRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.fail_persist {
            return Err(StoreError::Unavailable("persistence disabled".to_string()));
        }
        if !state.messages.iter().any(|existing| existing.id == record.id) {
            state.messages.push(record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InboundMessage;

    fn definition(broker: &str) -> ClientDefinition {
        ClientDefinition {
            brokers: vec![broker.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_stop_and_list_clients() {
        let store = MemoryStore::new();
        store.save_client("b", &definition("one")).await.unwrap();
        store.save_client("a", &definition("two")).await.unwrap();
        assert!(store.stop_client("b").await.unwrap());
        assert!(!store.stop_client("missing").await.unwrap());

        let active = store.active_clients().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].client_id, "a");

        // saving again reactivates
        store.save_client("b", &definition("three")).await.unwrap();
        let ids: Vec<String> = store
            .active_clients()
            .await
            .unwrap()
            .into_iter()
            .map(|client| client.client_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.is_stopped("b"), Some(false));
    }

    #[tokio::test]
    async fn test_persist_is_idempotent_and_can_fail() {
        let store = MemoryStore::new();
        let record = RelayRecord::new("c1", InboundMessage::new("t", "x"));
        store.persist(&record).await.unwrap();
        store.persist(&record).await.unwrap();
        assert_eq!(store.messages().len(), 1);

        store.fail_persist(true);
        let other = RelayRecord::new("c1", InboundMessage::new("t", "y"));
        assert!(store.persist(&other).await.is_err());
        assert_eq!(store.messages().len(), 1);
    }
}
