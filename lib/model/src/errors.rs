// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy surfaced by the registry and the model wrapper.
//!
//! Registry errors are fatal at startup. Model errors are per request and are turned
//! into HTTP responses by the service layer; only their `Display` text reaches clients.

use crate::model::ModelMethod;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("model '{name}' not found, available models: [{}]", .available.join(", "))]
    ModuleNotFound { name: String, available: Vec<String> },

    #[error("no models are available")]
    NoModelsAvailable,

    #[error(
        "multiple models found ([{}]) and none selected, choose one with --model or MODELSERVE_MODEL",
        .names.join(", ")
    )]
    MultipleModelsFound { names: Vec<String> },

    #[error("failed to build model '{name}': {reason}")]
    Construction { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("trying to validate against a schema, but model '{model}' does not define one")]
    MissingModelSchema { model: String },

    /// Details are logged; clients only see the generic message
    #[error("ERROR validating model response, check server logs")]
    ResponseValidation { model: String, problems: Vec<String> },

    #[error("model '{model}' defines an invalid schema: {reason}")]
    InvalidSchema { model: String, reason: String },

    #[error("invalid argument '{field}': {reason}")]
    InputValidation { field: String, reason: String },

    #[error("model '{model}' does not implement this functionality ({method})")]
    MethodNotImplemented { model: String, method: ModelMethod },

    #[error("unexpected error calling {method} on model '{model}' ({reason})")]
    MethodUnexpected {
        model: String,
        method: ModelMethod,
        reason: String,
    },

    #[error("request was cancelled")]
    Cancelled,

    #[error("model '{model}' is shut down")]
    ShutDown { model: String },
}

impl ModelError {
    /// Log `err` in full under a fresh error reference and return an error that only
    /// carries the reference.
    pub fn unexpected(model: &str, method: ModelMethod, err: &anyhow::Error) -> Self {
        let reference = uuid::Uuid::new_v4().to_string();
        tracing::error!(
            model,
            %method,
            %reference,
            error = format!("{err:?}"),
            "An error happened when calling a method on the model"
        );
        Self::with_reference(model, method, &reference)
    }

    pub(crate) fn with_reference(model: &str, method: ModelMethod, reference: &str) -> Self {
        ModelError::MethodUnexpected {
            model: model.to_string(),
            method,
            reason: format!("error reference {reference}"),
        }
    }

    pub fn input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::InputValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Problems belong to the caller's request rather than to the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ModelError::InputValidation { .. } | ModelError::MethodNotImplemented { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_messages_list_candidates() {
        let err = RegistryError::MultipleModelsFound {
            names: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("[a, b]"));

        let err = RegistryError::ModuleNotFound {
            name: "missing".into(),
            available: vec!["modelserve-test".into()],
        };
        assert_eq!(
            err.to_string(),
            "model 'missing' not found, available models: [modelserve-test]"
        );
    }

    #[test]
    fn test_unexpected_hides_details() {
        let err = anyhow::anyhow!("secret connection string");
        let model_err = ModelError::unexpected("demo", ModelMethod::Predict, &err);
        let message = model_err.to_string();
        assert!(!message.contains("secret"));
        assert!(message.contains("error reference"));
    }

    #[test]
    fn test_response_validation_message_is_generic() {
        let err = ModelError::ResponseValidation {
            model: "demo".into(),
            problems: vec!["labels: expected a list".into()],
        };
        assert_eq!(
            err.to_string(),
            "ERROR validating model response, check server logs"
        );
    }
}
