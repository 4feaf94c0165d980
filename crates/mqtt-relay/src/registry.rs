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

//! The subscription registry: the single source of truth for which logical
//! clients currently have a live upstream session.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchLoop, LoopState, wait_stopped};
use crate::errors::SubscribeError;
use crate::processor::SharedProcessor;
use crate::session::{BrokerSet, Credentials, SessionStatus, TopicMap, qos_to_u8};
use crate::stats::{SessionStats, SessionStatsTracker};
use crate::transport::{ConnectRequest, Connector, Delivery};

/// Tunables applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Capacity of each session's inbox. A full inbox holds the transport
    /// back until the dispatch loop catches up.
    pub inbox_capacity: usize,
    /// Upper bound on concurrently running processor tasks per session.
    pub max_in_flight_per_session: usize,
    /// How long after cancellation in-flight processors may keep running
    /// before teardown aborts them.
    pub drain_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            max_in_flight_per_session: 64,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// The registry's view of one live session. The session itself (transport,
/// inbox, processor) belongs to its dispatch loop; this is only what is
/// needed to observe it and stop it.
struct SessionHandle {
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
    brokers: BrokerSet,
    topics: TopicMap,
    stats: Arc<SessionStatsTracker>,
    started_at: DateTime<Utc>,
}

impl SessionHandle {
    // retire signals cancellation and waits until the dispatch loop reports
    // Stopped. Teardown bounds itself: transport calls carry their own
    // timeouts and processors are aborted at the drain deadline.
    async fn retire(self) {
        self.cancel.cancel();
        wait_stopped(self.state).await;
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub brokers: Vec<String>,
    pub topics: BTreeMap<String, u8>,
    pub state: LoopState,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
}

/// Maps client ids to live sessions. Shared by reference (normally in an
/// `Arc`) between the HTTP layer, startup replay and shutdown.
pub struct Registry {
    connector: Arc<dyn Connector>,
    settings: RegistrySettings,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl Registry {
    pub fn new(connector: Arc<dyn Connector>, settings: RegistrySettings) -> Self {
        Self {
            connector,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create the session for `client_id`, replacing any existing one.
    ///
    /// The new connection is opened and subscribed before the registry is
    /// touched, so on error nothing changes. On success the previous session
    /// (if any) is fully stopped before the new session's dispatch loop
    /// starts, so processors of the two never run at the same time.
    pub async fn subscribe(
        &self,
        client_id: &str,
        credentials: Credentials,
        brokers: BrokerSet,
        topics: TopicMap,
        processor: SharedProcessor,
    ) -> Result<(), SubscribeError> {
        if client_id.is_empty() {
            return Err(SubscribeError::InvalidClientId);
        }

        let stats = Arc::new(SessionStatsTracker::new());
        let (inbox_tx, inbox_rx) = mpsc::channel(self.settings.inbox_capacity.max(1));
        let delivery = Delivery::new(client_id, inbox_tx, stats.clone());
        let mut transport = self.connector.transport(
            ConnectRequest {
                client_id: client_id.to_string(),
                credentials,
                brokers: brokers.clone(),
            },
            delivery,
        );

        transport
            .connect()
            .await
            .map_err(|source| SubscribeError::Connect {
                client_id: client_id.to_string(),
                source,
            })?;

        if !topics.is_empty() {
            if let Err(source) = transport.subscribe_all(&topics).await {
                if let Err(error) = transport.disconnect().await {
                    tracing::warn!(client_id, %error, "disconnect after failed subscribe failed");
                }
                return Err(SubscribeError::Subscribe {
                    client_id: client_id.to_string(),
                    source,
                });
            }
        }

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Running);
        let mut handle = Some(SessionHandle {
            cancel: cancel.clone(),
            state: state_rx,
            brokers,
            topics: topics.clone(),
            stats: stats.clone(),
            started_at: Utc::now(),
        });

        // Retire whatever is registered under this id, then install ours. A
        // concurrent subscribe for the same id may slip in while we wait, so
        // keep going until the slot is empty when we hold the lock.
        loop {
            let previous = {
                let mut sessions = self.sessions.lock().expect("lock poisoned");
                match sessions.remove(client_id) {
                    Some(previous) => previous,
                    None => {
                        if let Some(handle) = handle.take() {
                            sessions.insert(client_id.to_string(), handle);
                        }
                        break;
                    }
                }
            };
            tracing::info!(client_id, "replacing existing session");
            previous.retire().await;
        }

        DispatchLoop {
            client_id: client_id.to_string(),
            topics: topics.clone(),
            transport,
            inbox: inbox_rx,
            processor,
            cancel,
            stats,
            state: state_tx,
            max_in_flight: self.settings.max_in_flight_per_session,
            drain_timeout: self.settings.drain_timeout,
        }
        .spawn();

        tracing::info!(client_id, topics = ?topics.keys().collect::<Vec<_>>(), "session started");
        Ok(())
    }

    /// Remove the session for `client_id` and signal it to stop. Returns
    /// immediately; the connection is torn down in the background. Unknown
    /// ids are ignored. Returns whether a session was removed.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let removed = self.sessions.lock().expect("lock poisoned").remove(client_id);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(client_id, "session unsubscribed");
                true
            }
            None => {
                tracing::debug!(client_id, "unsubscribe for unknown client ignored");
                false
            }
        }
    }

    /// Like [`Registry::unsubscribe`], but resolves once the session's
    /// connection is closed and its processors have finished.
    pub async fn unsubscribe_and_wait(&self, client_id: &str) -> bool {
        let removed = self.sessions.lock().expect("lock poisoned").remove(client_id);
        match removed {
            Some(handle) => {
                handle.retire().await;
                tracing::info!(client_id, "session unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, client_id: &str) -> SessionStatus {
        if self
            .sessions
            .lock()
            .expect("lock poisoned")
            .contains_key(client_id)
        {
            SessionStatus::Active
        } else {
            SessionStatus::Absent
        }
    }

    pub fn session_info(&self, client_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().expect("lock poisoned");
        let handle = sessions.get(client_id)?;
        Some(SessionInfo {
            client_id: client_id.to_string(),
            brokers: handle.brokers.iter().cloned().collect(),
            topics: handle
                .topics
                .iter()
                .map(|(topic, qos)| (topic.clone(), qos_to_u8(*qos)))
                .collect(),
            state: *handle.state.borrow(),
            started_at: handle.started_at,
            stats: handle.stats.to_stats(),
        })
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every session and wait for all of them to finish tearing down.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, SessionHandle)> = self
            .sessions
            .lock()
            .expect("lock poisoned")
            .drain()
            .collect();
        tracing::info!(count = sessions.len(), "stopping all sessions");

        join_all(sessions.into_iter().map(|(client_id, handle)| async move {
            handle.retire().await;
            tracing::debug!(client_id = %client_id, "session retired");
        }))
        .await;
    }
}
