// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{extract::State, http::Method, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};

use super::{service_v2, RouteDoc};

pub const API_VERSION: &str = "v2";

pub fn versions_router(state: Arc<service_v2::State>) -> (Vec<RouteDoc>, Router) {
    let version_path = format!("/{API_VERSION}");
    let docs = vec![
        RouteDoc::new(Method::GET, "/").with_summary("List available API versions"),
        RouteDoc::new(Method::GET, &version_path).with_summary("Describe API version v2"),
    ];

    let router = Router::new()
        .route("/", get(versions_handler))
        .route(&version_path, get(version_handler))
        .with_state(state);

    (docs, router)
}

fn version_links(state: &service_v2::State) -> Vec<Value> {
    let mut links = vec![json!({"rel": "self", "href": format!("/{API_VERSION}")})];
    if state.docs_enabled() {
        links.push(json!({"rel": "help", "href": "/docs"}));
        links.push(json!({"rel": "describedby", "href": "/openapi.json"}));
    }
    links
}

async fn versions_handler(State(state): State<Arc<service_v2::State>>) -> impl IntoResponse {
    Json(json!({
        "versions": [{
            "version": API_VERSION,
            "id": API_VERSION,
            "links": version_links(&state),
        }]
    }))
}

async fn version_handler(State(state): State<Arc<service_v2::State>>) -> impl IntoResponse {
    let mut links = version_links(&state);
    links.push(json!({"rel": "models", "href": format!("/{API_VERSION}/models")}));
    Json(json!({
        "version": API_VERSION,
        "id": API_VERSION,
        "links": links,
    }))
}
