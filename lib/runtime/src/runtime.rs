// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [Runtime] is the owning application context of a serving process.
//!
//! It holds the primary [`CancellationToken`], a child token that stops request intake,
//! the [`GracefulShutdownTracker`] for in-flight requests, and the cleanup hooks that
//! resources such as worker pools register so they are released when the process
//! shuts down, on both normal and error exit paths.

use super::utils::GracefulShutdownTracker;
use crate::config::RuntimeConfig;

use futures::future::BoxFuture;
use futures::Future;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Local [Runtime] shared by every component of the serving process.
#[derive(Clone)]
pub struct Runtime {
    id: Arc<String>,
    handle: tokio::runtime::Handle,
    cancellation_token: CancellationToken,
    endpoint_shutdown_token: CancellationToken,
    graceful_shutdown_tracker: Arc<GracefulShutdownTracker>,
    graceful_shutdown_timeout: Duration,
    shutdown_hooks: Arc<Mutex<Vec<(String, ShutdownHook)>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .field("shutdown_hooks", &self.shutdown_hooks.lock().len())
            .finish()
    }
}

impl Runtime {
    fn new(handle: tokio::runtime::Handle, config: &RuntimeConfig) -> Runtime {
        let cancellation_token = CancellationToken::new();
        let endpoint_shutdown_token = cancellation_token.child_token();

        Runtime {
            id: Arc::new(uuid::Uuid::new_v4().to_string()),
            handle,
            cancellation_token,
            endpoint_shutdown_token,
            graceful_shutdown_tracker: Arc::new(GracefulShutdownTracker::new()),
            graceful_shutdown_timeout: config.graceful_shutdown_timeout(),
            shutdown_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach to the Tokio runtime the caller is running on
    pub fn from_current() -> anyhow::Result<Runtime> {
        Ok(Runtime::from_handle(tokio::runtime::Handle::try_current()?))
    }

    pub fn from_handle(handle: tokio::runtime::Handle) -> Runtime {
        Runtime::new(handle, &RuntimeConfig::default())
    }

    /// Attach to the current Tokio runtime using the settings for shutdown behavior
    /// See [`RuntimeConfig::from_settings`]
    pub fn from_settings() -> anyhow::Result<Runtime> {
        let config = RuntimeConfig::from_settings()?;
        Ok(Runtime::new(tokio::runtime::Handle::try_current()?, &config))
    }

    /// Returns the unique identifier for the [`Runtime`]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a [`tokio::runtime::Handle`] for the application thread pool
    pub fn primary(&self) -> tokio::runtime::Handle {
        self.handle.clone()
    }

    /// Access the primary [`CancellationToken`] for the [`Runtime`]
    pub fn primary_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Creates a child [`CancellationToken`] cancelled as soon as shutdown begins.
    /// Servers use it to stop accepting new requests.
    pub fn child_token(&self) -> CancellationToken {
        self.endpoint_shutdown_token.child_token()
    }

    pub fn graceful_shutdown_tracker(&self) -> Arc<GracefulShutdownTracker> {
        self.graceful_shutdown_tracker.clone()
    }

    /// Register a cleanup hook to run during [`Runtime::shutdown`].
    /// Hooks run once, most recently registered first.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(hook = %name, "Registered shutdown hook");
        self.shutdown_hooks
            .lock()
            .push((name, Box::new(move || Box::pin(hook()))));
    }

    /// Shuts down the [`Runtime`]: stop intake, drain requests, run cleanup hooks,
    /// then cancel the primary token. Calling it again only re-cancels the tokens.
    pub async fn shutdown(&self) {
        tracing::info!("Runtime shutdown initiated");

        // Phase 1: stop accepting new requests
        self.endpoint_shutdown_token.cancel();

        // Phase 2: give in-flight requests a bounded window to finish
        let count = self.graceful_shutdown_tracker.get_count();
        if count != 0 {
            tracing::info!("Waiting for {} in-flight requests", count);
            if tokio::time::timeout(
                self.graceful_shutdown_timeout,
                self.graceful_shutdown_tracker.wait_for_completion(),
            )
            .await
            .is_err()
            {
                tracing::warn!(
                    remaining = self.graceful_shutdown_tracker.get_count(),
                    "Graceful shutdown timeout elapsed, continuing"
                );
            }
        }

        // Phase 3: release owned resources
        let hooks = std::mem::take(&mut *self.shutdown_hooks.lock());
        for (name, hook) in hooks.into_iter().rev() {
            tracing::debug!(hook = %name, "Running shutdown hook");
            hook().await;
        }

        // Phase 4: everything else
        self.cancellation_token.cancel();
        tracing::info!("Runtime shutdown complete");
    }
}
