// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use derive_builder::Builder;
use modelserve_runtime::logging::{make_request_span, DebugBuffer};
use modelserve_runtime::utils::{GracefulShutdownTracker, InFlightGuard};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::train::TrainingHistory;
use super::RouteDoc;
use crate::config::ServiceConfig;
use crate::wrapper::ModelWrapper;

/// HTTP service shared state
pub struct State {
    wrapper: Arc<ModelWrapper>,
    trainings: Arc<TrainingHistory>,
    debug: Option<DebugBuffer>,
    tracker: Option<Arc<GracefulShutdownTracker>>,
    docs_enabled: bool,
}

impl State {
    pub fn wrapper(&self) -> &Arc<ModelWrapper> {
        &self.wrapper
    }

    pub fn trainings(&self) -> &Arc<TrainingHistory> {
        &self.trainings
    }

    /// Captured log output, only when the debug endpoint is enabled
    pub fn debug_buffer(&self) -> Option<DebugBuffer> {
        self.debug.clone()
    }

    pub fn docs_enabled(&self) -> bool {
        self.docs_enabled
    }

    /// Count a request as in flight until the guard drops, so shutdown waits for it
    pub fn track_request(&self) -> Option<InFlightGuard> {
        self.tracker.as_ref().map(|tracker| tracker.track())
    }
}

#[derive(Clone)]
pub struct HttpService {
    state: Arc<State>,
    router: Router,
    port: u16,
    host: String,
    route_docs: Vec<RouteDoc>,
}

#[derive(Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct HttpServiceConfig {
    #[builder(default = "5000")]
    port: u16,

    #[builder(setter(into), default = "String::from(\"127.0.0.1\")")]
    host: String,

    #[builder(setter(into))]
    wrapper: Arc<ModelWrapper>,

    #[builder(default = "true")]
    enable_predict_endpoint: bool,

    #[builder(default = "true")]
    enable_train_endpoint: bool,

    #[builder(default = "true")]
    enable_doc_endpoint: bool,

    #[builder(default = "false")]
    enable_debug_endpoint: bool,

    /// Largest accepted request body in bytes; 0 means unlimited
    #[builder(default = "0")]
    client_max_size: usize,

    #[builder(default = "None")]
    debug_buffer: Option<DebugBuffer>,

    #[builder(default = "None")]
    shutdown_tracker: Option<Arc<GracefulShutdownTracker>>,
}

impl HttpService {
    pub fn builder() -> HttpServiceConfigBuilder {
        HttpServiceConfigBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Documentation of every mounted route
    pub fn route_docs(&self) -> &[RouteDoc] {
        &self.route_docs
    }

    pub async fn spawn(&self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel_token).await })
    }

    pub async fn run(&self, cancel_token: CancellationToken) -> Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        tracing::info!(address, model = self.state.wrapper().name(), "Starting HTTP service");

        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind to address {address}"))?;
        tracing::debug!("HTTP service bound to {}", listener.local_addr()?);

        let router = self.router.clone();
        let observer = cancel_token.child_token();

        axum::serve(listener, router)
            .with_graceful_shutdown(observer.cancelled_owned())
            .await
            .inspect_err(|_| cancel_token.cancel())?;

        tracing::info!("HTTP service stopped");
        Ok(())
    }
}

impl HttpServiceConfigBuilder {
    pub fn build(self) -> Result<HttpService> {
        let config: HttpServiceConfig = self.build_internal()?;

        let state = Arc::new(State {
            wrapper: config.wrapper,
            trainings: Arc::new(TrainingHistory::new()),
            debug: config
                .enable_debug_endpoint
                .then_some(config.debug_buffer)
                .flatten(),
            tracker: config.shutdown_tracker,
            docs_enabled: config.enable_doc_endpoint,
        });

        let mut routes = vec![
            super::versions::versions_router(state.clone()),
            super::models::models_router(state.clone()),
            super::debug::debug_router(state.clone(), None),
        ];
        if config.enable_predict_endpoint {
            routes.push(super::predict::predict_router(state.clone(), None));
        }
        if config.enable_train_endpoint {
            routes.push(super::train::train_router(state.clone(), None));
        }

        let mut router = Router::new();
        let mut all_docs = Vec::new();
        for (route_docs, route) in routes {
            router = router.merge(route);
            all_docs.extend(route_docs);
        }

        if config.enable_doc_endpoint {
            let (openapi_docs, openapi_route) =
                super::openapi_docs::openapi_router(all_docs.clone(), None);
            router = router.merge(openapi_route);
            all_docs.extend(openapi_docs);
        }

        let body_limit = match config.client_max_size {
            0 => DefaultBodyLimit::disable(),
            limit => DefaultBodyLimit::max(limit),
        };
        let router = router
            .layer(body_limit)
            .layer(TraceLayer::new_for_http().make_span_with(make_request_span));

        for doc in &all_docs {
            tracing::debug!("Route enabled: {}", doc);
        }

        Ok(HttpService {
            state,
            router,
            port: config.port,
            host: config.host,
            route_docs: all_docs,
        })
    }

    /// Take the host, port, endpoint switches and body limit from the service config.
    pub fn with_service_config(self, config: &ServiceConfig) -> Self {
        self.host(config.host.clone())
            .port(config.port)
            .enable_predict_endpoint(config.predict_endpoint)
            .enable_train_endpoint(config.train_endpoint)
            .enable_doc_endpoint(config.doc_endpoint)
            .enable_debug_endpoint(config.debug_endpoint)
            .client_max_size(config.client_max_size)
    }
}
