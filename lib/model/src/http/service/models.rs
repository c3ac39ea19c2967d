// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::Method,
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};

use super::error::HttpError;
use super::versions::API_VERSION;
use super::{service_v2, RouteDoc};
use crate::wrapper::ModelWrapper;

pub fn models_router(state: Arc<service_v2::State>) -> (Vec<RouteDoc>, Router) {
    let list_path = format!("/{API_VERSION}/models");
    let model_path = format!("/{API_VERSION}/models/{{name}}");

    let docs = vec![
        RouteDoc::new(Method::GET, &list_path).with_summary("Return loaded models and their metadata"),
        RouteDoc::new(Method::GET, &model_path).with_summary("Return model metadata"),
    ];

    let router = Router::new()
        .route(&list_path, get(list_models))
        .route(&model_path, get(get_model))
        .with_state(state);

    (docs, router)
}

/// Model metadata with `id`, `name` and a self link; the model's own keys win.
pub(crate) fn model_entry(wrapper: &ModelWrapper) -> Value {
    let name = wrapper.name();
    let mut entry = Map::new();
    entry.insert("id".to_string(), json!(name));
    entry.insert("name".to_string(), json!(name));
    entry.insert(
        "links".to_string(),
        json!([{"rel": "self", "href": format!("/{API_VERSION}/models/{name}")}]),
    );
    if let Value::Object(metadata) = wrapper.get_metadata() {
        entry.extend(metadata);
    }
    Value::Object(entry)
}

async fn list_models(State(state): State<Arc<service_v2::State>>) -> Json<Value> {
    Json(json!({ "models": [model_entry(state.wrapper())] }))
}

async fn get_model(
    State(state): State<Arc<service_v2::State>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let wrapper = state.wrapper();
    if name != wrapper.name() {
        return Err(HttpError::not_found(format!("model '{name}' not found")));
    }
    Ok(Json(model_entry(wrapper)))
}
