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

//! The per-session dispatch loop.
//!
//! One loop runs per session. It owns the session's transport and inbox,
//! fans every inbound message out to its own processor task, and on
//! cancellation tears the connection down: close the inbox, unsubscribe,
//! disconnect, wait for in-flight processors, then report [`LoopState::Stopped`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::processor::SharedProcessor;
use crate::session::{InboundMessage, TopicMap};
use crate::stats::SessionStatsTracker;
use crate::transport::Transport;

/// Lifecycle of a dispatch loop. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Running,
    Draining,
    Stopped,
}

pub(crate) struct DispatchLoop {
    pub client_id: String,
    pub topics: TopicMap,
    pub transport: Box<dyn Transport>,
    pub inbox: mpsc::Receiver<InboundMessage>,
    pub processor: SharedProcessor,
    pub cancel: CancellationToken,
    pub stats: Arc<SessionStatsTracker>,
    pub state: watch::Sender<LoopState>,
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
}

impl DispatchLoop {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        tracing::debug!(client_id = %self.client_id, "dispatch loop running");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(&self.client_id, joined);
                }

                message = self.inbox.recv() => {
                    let Some(message) = message else {
                        tracing::debug!(client_id = %self.client_id, "inbox closed by transport");
                        break;
                    };
                    let permit = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.stats.increment_discarded();
                            break;
                        }
                        permit = permits.clone().acquire_owned() => permit,
                    };
                    // The semaphore is never closed.
                    let Ok(permit) = permit else { break };

                    self.stats.increment_pending();
                    let processor = self.processor.clone();
                    let stats = self.stats.clone();
                    let client_id = self.client_id.clone();
                    tasks.spawn(async move {
                        process_one(processor, &client_id, message, &stats).await;
                        drop(permit);
                    });
                }
            }
        }

        self.teardown(tasks).await;
    }

    async fn teardown(mut self, mut tasks: JoinSet<()>) {
        // In-flight processors get drain_timeout from here, however long the
        // unsubscribe and disconnect below take.
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        self.state.send_replace(LoopState::Draining);
        tracing::debug!(client_id = %self.client_id, "dispatch loop draining");

        // Anything still queued, or delivered from here on, is discarded.
        self.inbox.close();
        while self.inbox.try_recv().is_ok() {
            self.stats.increment_discarded();
        }

        if !self.topics.is_empty() {
            if let Err(error) = self.transport.unsubscribe_all(&self.topics).await {
                tracing::warn!(client_id = %self.client_id, %error, "unsubscribe during teardown failed");
            }
        }
        if let Err(error) = self.transport.disconnect().await {
            tracing::warn!(client_id = %self.client_id, %error, "disconnect during teardown failed");
        }

        let client_id = self.client_id.as_str();
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                reap(client_id, joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                client_id = %self.client_id,
                in_flight = tasks.len(),
                "processors still running after drain timeout, aborting them"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if matches!(&joined, Err(error) if error.is_cancelled()) {
                    self.stats.decrement_pending_increment_failed();
                }
            }
        }

        self.state.send_replace(LoopState::Stopped);
        tracing::info!(client_id = %self.client_id, "session stopped");
    }
}

fn reap(client_id: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        tracing::error!(client_id, %error, "processor task failed to join");
    }
}

// process_one runs the processor for a single message, containing both
// errors and panics so they never reach the loop.
async fn process_one(
    processor: SharedProcessor,
    client_id: &str,
    message: InboundMessage,
    stats: &SessionStatsTracker,
) {
    let topic = message.topic.clone();
    match AssertUnwindSafe(processor.process(client_id, message))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => stats.decrement_pending_increment_processed(),
        Ok(Err(error)) => {
            stats.decrement_pending_increment_failed();
            tracing::warn!(client_id, topic = %topic, %error, "processing message failed");
        }
        Err(panic) => {
            stats.decrement_pending_increment_failed();
            tracing::error!(
                client_id,
                topic = %topic,
                panic = panic_message(panic.as_ref()),
                "processor panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic>"
    }
}

// wait_stopped resolves once the loop behind `state` reports Stopped, or
// its task has gone away entirely.
pub(crate) async fn wait_stopped(mut state: watch::Receiver<LoopState>) {
    state
        .wait_for(|state| *state == LoopState::Stopped)
        .await
        .ok();
}
