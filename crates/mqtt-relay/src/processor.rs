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

// src/processor.rs
// The per-message processing seam between a session's dispatch loop and
// whatever the message should turn into (normally a RelaySink).

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ProcessingError;
use crate::session::InboundMessage;

// MessageProcessor handles one inbound message for one client. It is
// invoked concurrently from independent tasks, so implementations must be
// shareable across them.
//
// Example:
// struct Printer;
//
// #[async_trait]
// impl MessageProcessor for Printer {
//     async fn process(&self, client_id: &str, message: InboundMessage) -> Result<(), ProcessingError> {
//         println!("[{client_id}] {}", message.topic);
//         Ok(())
//     }
// }
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(&self, client_id: &str, message: InboundMessage)
    -> Result<(), ProcessingError>;
}

// SharedProcessor is how the registry and dispatch loop hold processors.
pub type SharedProcessor = Arc<dyn MessageProcessor>;

// ClosureProcessor wraps a closure so it can be used wherever a
// MessageProcessor is expected. Mostly handy in tests and for ad-hoc
// processing.
pub struct ClosureProcessor<F, Fut>
where
    F: Fn(String, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    closure: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ClosureProcessor<F, Fut>
where
    F: Fn(String, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    pub fn new(closure: F) -> Self {
        Self {
            closure,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageProcessor for ClosureProcessor<F, Fut>
where
    F: Fn(String, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn process(
        &self,
        client_id: &str,
        message: InboundMessage,
    ) -> Result<(), ProcessingError> {
        (self.closure)(client_id.to_string(), message).await
    }
}

// processor_fn builds a SharedProcessor from a closure.
pub fn processor_fn<F, Fut>(closure: F) -> SharedProcessor
where
    F: Fn(String, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    Arc::new(ClosureProcessor::new(closure))
}
