// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error responses: every failure leaves the service as `{"error": "<message>"}`.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error on its way to the client
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Status code for a model error
pub fn status_for(err: &ModelError) -> StatusCode {
    match err {
        ModelError::InputValidation { .. } => StatusCode::BAD_REQUEST,
        ModelError::MethodNotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        ModelError::MissingModelSchema { .. }
        | ModelError::ResponseValidation { .. }
        | ModelError::InvalidSchema { .. }
        | ModelError::MethodUnexpected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ModelError::Cancelled | ModelError::ShutDown { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<ModelError> for HttpError {
    fn from(err: ModelError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::debug!(error = %err, %status, "Request failed");
        }
        HttpError::new(status, err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Middleware converting plain-text error responses (extractor rejections, body limit,
/// unknown methods) into the JSON error format.
pub async fn json_error_middleware(request: Request, next: Next) -> Response {
    let response = next.run(request).await;

    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.as_bytes().starts_with(b"application/json"))
        .unwrap_or(false);

    if !(status.is_client_error() || status.is_server_error()) || is_json {
        return response;
    }

    let (_parts, body) = response.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let mut error_message = String::from_utf8_lossy(&body_bytes).to_string();
    if error_message.is_empty() {
        error_message = status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }

    (
        status,
        Json(ErrorResponse {
            error: error_message,
        }),
    )
        .into_response()
}
