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

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

/// A background task paired with the [`oneshot::Sender<()>`] that stops it.
///
/// Dropping the sender and sending on it mean the same thing: "shut down now". Tasks wait on the
/// receiving half and treat either outcome as the signal.
pub trait ShutdownHandle<R> {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<R>);

    /// Signal shutdown and wait for the task to finish.
    fn shutdown_and_wait(self) -> impl std::future::Future<Output = Result<R, JoinError>> + Send
    where
        Self: Send + Sized,
        R: Send,
    {
        async move {
            let (shutdown_tx, join_handle) = self.into_parts();
            std::mem::drop(shutdown_tx);
            join_handle.await
        }
    }

    /// Like [`ShutdownHandle::shutdown_and_wait`], but gives up (and aborts the task) after
    /// `timeout`. Returns `None` if the task had to be aborted or panicked.
    fn shutdown_within(self, timeout: Duration) -> impl std::future::Future<Output = Option<R>> + Send
    where
        Self: Send + Sized,
        R: Send,
    {
        async move {
            let (shutdown_tx, mut join_handle) = self.into_parts();
            std::mem::drop(shutdown_tx);
            match tokio::time::timeout(timeout, &mut join_handle).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    tracing::warn!("task did not shut down within {timeout:?}, aborting it");
                    join_handle.abort();
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Waiter {
        shutdown_tx: oneshot::Sender<()>,
        join_handle: JoinHandle<&'static str>,
    }

    impl ShutdownHandle<&'static str> for Waiter {
        fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<&'static str>) {
            (self.shutdown_tx, self.join_handle)
        }
    }

    fn waiter(ignore_shutdown: bool) -> Waiter {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            if ignore_shutdown {
                std::future::pending::<()>().await;
            }
            shutdown_rx.await.ok();
            "stopped"
        });
        Waiter {
            shutdown_tx,
            join_handle,
        }
    }

    #[tokio::test]
    async fn test_shutdown_and_wait_returns_task_output() {
        assert_eq!(waiter(false).shutdown_and_wait().await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn test_shutdown_within_aborts_stuck_task() {
        assert_eq!(
            waiter(true)
                .shutdown_within(Duration::from_millis(20))
                .await,
            None
        );
    }
}
