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

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::errors::StoreError;
use crate::relay::RelayRecord;
use crate::store::{ClientDefinition, ClientStore, MessageStore, StoredClient, migrations};

/// Postgres-backed store. Client definitions live in `client`, relayed
/// messages in `t_message`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct ClientRow {
    id: String,
    payload: String,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run any pending migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        Ok(migrations::migrate(&self.pool).await?)
    }
}

#[async_trait]
impl ClientStore for PgStore {
    async fn save_client(
        &self,
        client_id: &str,
        definition: &ClientDefinition,
    ) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(definition).map_err(|source| StoreError::InvalidPayload {
                client_id: client_id.to_string(),
                source,
            })?;
        let query = "INSERT INTO client (id, payload, stopped)
            VALUES ($1, $2, FALSE)
            ON CONFLICT (id) DO UPDATE
            SET payload = EXCLUDED.payload, stopped = FALSE, updated_at = now()";
        sqlx::query(query)
            .bind(client_id)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::query(query, e))
    }

    async fn stop_client(&self, client_id: &str) -> Result<bool, StoreError> {
        let query = "UPDATE client SET stopped = TRUE, updated_at = now() WHERE id = $1";
        sqlx::query(query)
            .bind(client_id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| StoreError::query(query, e))
    }

    async fn active_clients(&self) -> Result<Vec<StoredClient>, StoreError> {
        let query = "SELECT id, payload FROM client WHERE stopped = FALSE ORDER BY id";
        let rows: Vec<ClientRow> = sqlx::query_as(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::query(query, e))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row.payload) {
                Ok(definition) => Some(StoredClient {
                    client_id: row.id,
                    definition,
                }),
                Err(error) => {
                    tracing::warn!(client_id = %row.id, %error, "skipping client with unreadable payload");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn persist(&self, record: &RelayRecord) -> Result<(), StoreError> {
        let query = "INSERT INTO t_message (id, client_id, topic, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING";
        sqlx::query(query)
            .bind(record.id)
            .bind(&record.client_id)
            .bind(&record.topic)
            .bind(record.payload.as_ref())
            .bind(record.received_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::query(query, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TopicSubscription;
    use crate::session::InboundMessage;

    fn definition(topic: &str) -> ClientDefinition {
        ClientDefinition {
            username: "user".to_string(),
            password: "secret".to_string(),
            brokers: vec!["tcp://localhost:1883".to_string()],
            topics: vec![TopicSubscription {
                topic: topic.to_string(),
                qos: 1,
            }],
        }
    }

    #[sqlx::test(migrator = "crate::store::migrations::MIGRATOR")]
    async fn test_save_replaces_and_stop_hides_clients(pool: PgPool) {
        let store = PgStore::from_pool(pool);

        store.save_client("b", &definition("first")).await.unwrap();
        store.save_client("a", &definition("other")).await.unwrap();
        store.save_client("b", &definition("second")).await.unwrap();

        let active = store.active_clients().await.unwrap();
        assert_eq!(
            active,
            vec![
                StoredClient {
                    client_id: "a".to_string(),
                    definition: definition("other"),
                },
                StoredClient {
                    client_id: "b".to_string(),
                    definition: definition("second"),
                },
            ]
        );

        assert!(store.stop_client("a").await.unwrap());
        assert!(!store.stop_client("never-saved").await.unwrap());
        let active = store.active_clients().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].client_id, "b");

        // Saving again brings a stopped client back.
        store.save_client("a", &definition("other")).await.unwrap();
        assert_eq!(store.active_clients().await.unwrap().len(), 2);
    }

    #[sqlx::test(migrator = "crate::store::migrations::MIGRATOR")]
    async fn test_unreadable_payload_is_skipped(pool: PgPool) {
        sqlx::query("INSERT INTO client (id, payload) VALUES ('broken', 'not json')")
            .execute(&pool)
            .await
            .unwrap();
        let store = PgStore::from_pool(pool);
        store.save_client("good", &definition("t")).await.unwrap();

        let active = store.active_clients().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].client_id, "good");
    }

    #[sqlx::test(migrator = "crate::store::migrations::MIGRATOR")]
    async fn test_persist_is_idempotent_per_record(pool: PgPool) {
        let store = PgStore::from_pool(pool.clone());
        let record = RelayRecord::new("c1", InboundMessage::new("sensors/temp", &b"\x00\x01"[..]));

        store.persist(&record).await.unwrap();
        store.persist(&record).await.unwrap();

        let rows: Vec<(String, String, Vec<u8>)> =
            sqlx::query_as("SELECT client_id, topic, payload FROM t_message")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(
            rows,
            vec![("c1".to_string(), "sensors/temp".to_string(), vec![0u8, 1])]
        );
    }
}
