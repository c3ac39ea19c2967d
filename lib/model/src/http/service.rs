// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP service for a wrapped model
//!
//! Each area of the API lives in its own module and exposes a router function
//! returning the [`RouteDoc`]s it serves together with an axum [`axum::Router`].
//! [`service_v2::HttpService`] merges them and documents the result with OpenAPI.
//!
//! ## Endpoints
//!
//! - `GET /` and `GET /v2`: API versions
//! - `GET /v2/models`, `GET /v2/models/{name}`: model metadata
//! - `POST /v2/models/{name}/predict`: run a prediction
//! - `POST|GET /v2/models/{name}/train`, `GET|DELETE /v2/models/{name}/train/{uuid}`: training
//! - `GET /debug`: captured log output
//! - `GET /openapi.json`, `GET /docs`: API documentation

use std::fmt;

use axum::http::Method;

use crate::schema::ArgSpecs;

pub mod debug;
pub mod error;
pub mod models;
pub mod openapi_docs;
pub mod predict;
pub mod service_v2;
pub mod train;
pub mod versions;

mod input;

/// Documentation for a route, used to build the OpenAPI document
#[derive(Debug, Clone)]
pub struct RouteDoc {
    method: Method,
    path: String,
    summary: Option<String>,
    args: Option<ArgSpecs>,
}

impl RouteDoc {
    pub fn new<T: Into<String>>(method: Method, path: T) -> Self {
        RouteDoc {
            method,
            path: path.into(),
            summary: None,
            args: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Arguments the route accepts, documented as request parameters
    pub fn with_args(mut self, args: ArgSpecs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn args(&self) -> Option<&ArgSpecs> {
        self.args.as_ref()
    }
}

impl fmt::Display for RouteDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
