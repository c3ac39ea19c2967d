// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio_util::sync::CancellationToken;

use super::error::{json_error_middleware, HttpError};
use super::versions::API_VERSION;
use super::{input, service_v2, RouteDoc};
use crate::args::parse_args;
use crate::wrapper::PredictResponse;

pub fn predict_router(state: Arc<service_v2::State>, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let wrapper = state.wrapper();
    let predict_path = path
        .unwrap_or_else(|| format!("/{API_VERSION}/models/{}/predict", wrapper.name()));

    let docs = vec![RouteDoc::new(Method::POST, &predict_path)
        .with_summary("Make a prediction given the input data")
        .with_args(wrapper.get_predict_args())];

    let router = Router::new()
        .route(&predict_path, post(predict_handler))
        .layer(middleware::from_fn(json_error_middleware))
        .with_state(state);

    (docs, router)
}

async fn predict_handler(
    State(state): State<Arc<service_v2::State>>,
    request: Request,
) -> Result<Response, HttpError> {
    let _inflight = state.track_request();
    let wrapper = state.wrapper();

    let specs = wrapper.get_predict_args();
    let inputs = input::request_inputs(request, &specs).await?;
    let args = parse_args(&specs, inputs)?;

    // the pool cancels the job if this future is dropped on client disconnect
    let cancel = CancellationToken::new();
    match wrapper.predict(args, &cancel).await? {
        PredictResponse::Json(value) => Ok(Json(value).into_response()),
        PredictResponse::File(file) => {
            let content_type = file
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let disposition = file
                .original_filename
                .as_ref()
                .map(|name| format!("attachment; filename=\"{name}\""));
            let data = file.take().await.map_err(|err| {
                tracing::error!(error = %err, "Failed to read prediction result file");
                HttpError::internal("failed to read prediction result")
            })?;

            let mut response = ([(header::CONTENT_TYPE, content_type)], data).into_response();
            if let Some(disposition) = disposition.and_then(|d| d.parse::<HeaderValue>().ok()) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, disposition);
            }
            Ok(response)
        }
    }
}
