// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts in-flight requests so shutdown can wait for them to drain
pub struct GracefulShutdownTracker {
    in_flight: AtomicUsize,
    drained: Notify,
}

impl std::fmt::Debug for GracefulShutdownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulShutdownTracker")
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for GracefulShutdownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdownTracker {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Register a request; it counts as in flight until the guard is dropped
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Request registered, in flight: {} -> {}", count, count + 1);
        InFlightGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!("Request finished, in flight: {} -> {}", prev, prev - 1);
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Get the current count of in-flight requests
    pub fn get_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn wait_for_completion(&self) {
        loop {
            // Create the waiter BEFORE checking the condition
            let notified = self.drained.notified();

            let count = self.in_flight.load(Ordering::SeqCst);
            if count == 0 {
                tracing::debug!("All in-flight requests completed");
                break;
            }

            tracing::debug!("Waiting for {} in-flight requests", count);
            notified.await;
        }
    }
}

/// Marks one request as in flight for as long as it lives
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<GracefulShutdownTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
