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

// src/stats.rs
// Lock-free counters for a session's inbound pipeline and for the ingestor.
//
// Trackers are shared between the transport delivery callback, the dispatch
// loop and its processor tasks, so every counter is an atomic and snapshots
// never take a lock.

use std::sync::atomic::{AtomicUsize, Ordering};

// SessionStats stores a snapshot of one session's inbound message pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionStats {
    // total_received is every message the transport handed to the inbox.
    pub total_received: usize,
    // total_discarded is messages that arrived after the session started
    // draining and were thrown away.
    pub total_discarded: usize,
    // pending_messages is messages currently inside a processor task.
    pub pending_messages: usize,
    // total_processed is processor invocations that returned Ok.
    pub total_processed: usize,
    // total_failed is processor invocations that returned an error or
    // panicked.
    pub total_failed: usize,
    // total_event_loop_errors counts connection errors seen by the
    // transport's event loop.
    pub total_event_loop_errors: usize,
}

// SessionStatsTracker enables thread-safe updates to session statistics.
#[derive(Debug, Default)]
pub struct SessionStatsTracker {
    received: AtomicUsize,
    discarded: AtomicUsize,
    pending: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    event_loop_errors: AtomicUsize,
}

impl SessionStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // increment_received records a message accepted into the inbox.
    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    // increment_discarded records a message that showed up after the
    // inbox was closed for teardown.
    pub fn increment_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_event_loop_errors(&self) {
        self.event_loop_errors.fetch_add(1, Ordering::Relaxed);
    }

    // increment_pending is called when a processor task is spawned.
    pub fn increment_pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    // decrement_pending_increment_processed moves a message from pending
    // to processed once its processor returns Ok.
    pub fn decrement_pending_increment_processed(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    // decrement_pending_increment_failed moves a message from pending to
    // failed once its processor errors or panics.
    pub fn decrement_pending_increment_failed(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    // is_idle is true when no processor task is running.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Relaxed) == 0
    }

    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            total_received: self.received.load(Ordering::Relaxed),
            total_discarded: self.discarded.load(Ordering::Relaxed),
            pending_messages: self.pending.load(Ordering::Relaxed),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            total_event_loop_errors: self.event_loop_errors.load(Ordering::Relaxed),
        }
    }
}

// IngestStats stores a snapshot of the ingestor's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestStats {
    pub total_received: usize,
    pub total_malformed: usize,
    pub total_persisted: usize,
    pub total_failed: usize,
}

#[derive(Debug, Default)]
pub struct IngestStatsTracker {
    received: AtomicUsize,
    malformed: AtomicUsize,
    persisted: AtomicUsize,
    failed: AtomicUsize,
}

impl IngestStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_stats(&self) -> IngestStats {
        IngestStats {
            total_received: self.received.load(Ordering::Relaxed),
            total_malformed: self.malformed.load(Ordering::Relaxed),
            total_persisted: self.persisted.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_stats_lifecycle() {
        let tracker = SessionStatsTracker::new();
        assert!(tracker.is_idle());

        tracker.increment_received();
        tracker.increment_received();
        tracker.increment_pending();
        tracker.increment_pending();
        assert!(!tracker.is_idle());

        tracker.decrement_pending_increment_processed();
        tracker.decrement_pending_increment_failed();
        tracker.increment_discarded();

        let stats = tracker.to_stats();
        assert_eq!(stats.total_received, 2);
        assert_eq!(stats.pending_messages, 0);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_discarded, 1);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_ingest_stats_snapshot() {
        let tracker = IngestStatsTracker::new();
        tracker.increment_received();
        tracker.increment_received();
        tracker.increment_malformed();
        tracker.increment_persisted();

        assert_eq!(
            tracker.to_stats(),
            IngestStats {
                total_received: 2,
                total_malformed: 1,
                total_persisted: 1,
                total_failed: 0,
            }
        );
    }
}
