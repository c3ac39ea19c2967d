// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `GET /debug` returns everything logged since startup when the debug endpoint is
//! enabled and log capture is on. Otherwise it answers 204 No Content.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use super::{service_v2, RouteDoc};

pub fn debug_router(state: Arc<service_v2::State>, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let debug_path = path.unwrap_or_else(|| "/debug".to_string());

    let docs = vec![RouteDoc::new(Method::GET, &debug_path)
        .with_summary("Return debug information if enabled by the API")];

    let router = Router::new()
        .route(&debug_path, get(debug_handler))
        .with_state(state);

    (docs, router)
}

async fn debug_handler(State(state): State<Arc<service_v2::State>>) -> Response {
    let Some(buffer) = state.debug_buffer() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    buffer.append_line(&format!(
        "--- DEBUG MARKER {} ---",
        chrono::Utc::now().to_rfc3339()
    ));
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer.contents(),
    )
        .into_response()
}
