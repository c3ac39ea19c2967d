// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The capability contract of a servable model.
//!
//! A [`Model`] is a set of optional handlers fixed at construction. A missing handler
//! means the model does not offer that operation; a handler that decides at runtime
//! can return [`NotImplemented`] instead, which is treated the same way.
//!
//! ```
//! use modelserve_model::{Model, Output};
//! use serde_json::json;
//!
//! let model = Model::builder()
//!     .metadata(|| Ok(json!({"id": "0", "name": "echo", "description": "Echo"})))
//!     .predict(|args, _cancel| Ok(Output::Json(serde_json::to_value(args)?)))
//!     .build();
//! assert!(model.capabilities().predict);
//! assert!(!model.capabilities().train);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::schema::{ArgSpecs, SchemaSpec};

pub type MetadataFn = Box<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;
pub type PredictFn = Box<dyn Fn(Args, &CancellationToken) -> anyhow::Result<Output> + Send + Sync>;
pub type TrainFn = Box<dyn Fn(Args, &CancellationToken) -> anyhow::Result<Value> + Send + Sync>;
pub type ArgSpecsFn = Box<dyn Fn() -> anyhow::Result<ArgSpecs> + Send + Sync>;
pub type WarmFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Returned by a handler to say the model does not offer this operation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("not implemented by the model")]
pub struct NotImplemented;

/// Returned by a handler that stopped early because its cancellation token fired.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMethod {
    Metadata,
    Predict,
    Train,
    PredictArgs,
    TrainArgs,
    Warm,
}

impl fmt::Display for ModelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelMethod::Metadata => "get_metadata",
            ModelMethod::Predict => "predict",
            ModelMethod::Train => "train",
            ModelMethod::PredictArgs => "get_predict_args",
            ModelMethod::TrainArgs => "get_train_args",
            ModelMethod::Warm => "warm",
        };
        f.write_str(name)
    }
}

/// What a prediction produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Json(Value),
    /// Raw content, written to a file so it can leave the worker
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    /// A file the model wrote; the server takes ownership and removes it once sent
    File {
        path: PathBuf,
        content_type: Option<String>,
        original_filename: Option<String>,
    },
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Json(value)
    }
}

/// Which optional operations a model offers, recorded once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub metadata: bool,
    pub predict: bool,
    pub train: bool,
    pub predict_args: bool,
    pub train_args: bool,
    pub warm: bool,
    pub schema: bool,
}

#[derive(Default)]
pub struct Model {
    pub(crate) metadata: Option<MetadataFn>,
    pub(crate) predict: Option<PredictFn>,
    pub(crate) train: Option<TrainFn>,
    pub(crate) predict_args: Option<ArgSpecsFn>,
    pub(crate) train_args: Option<ArgSpecsFn>,
    pub(crate) warm: Option<WarmFn>,
    pub(crate) schema: Option<SchemaSpec>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            metadata: self.metadata.is_some(),
            predict: self.predict.is_some(),
            train: self.train.is_some(),
            predict_args: self.predict_args.is_some(),
            train_args: self.train_args.is_some(),
            warm: self.warm.is_some(),
            schema: self.schema.is_some(),
        }
    }

    pub fn schema(&self) -> Option<&SchemaSpec> {
        self.schema.as_ref()
    }

    /// Call the metadata handler in place. Fails with [`NotImplemented`] when there is none.
    pub fn metadata(&self) -> anyhow::Result<Value> {
        match self.metadata.as_ref() {
            Some(handler) => catch_panic(handler),
            None => Err(NotImplemented.into()),
        }
    }
}

#[derive(Default)]
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn metadata<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.model.metadata = Some(Box::new(f));
        self
    }

    pub fn predict<F>(mut self, f: F) -> Self
    where
        F: Fn(Args, &CancellationToken) -> anyhow::Result<Output> + Send + Sync + 'static,
    {
        self.model.predict = Some(Box::new(f));
        self
    }

    pub fn train<F>(mut self, f: F) -> Self
    where
        F: Fn(Args, &CancellationToken) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.model.train = Some(Box::new(f));
        self
    }

    pub fn predict_args<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<ArgSpecs> + Send + Sync + 'static,
    {
        self.model.predict_args = Some(Box::new(f));
        self
    }

    pub fn train_args<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<ArgSpecs> + Send + Sync + 'static,
    {
        self.model.train_args = Some(Box::new(f));
        self
    }

    pub fn warm<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.model.warm = Some(Box::new(f));
        self
    }

    pub fn schema(mut self, schema: SchemaSpec) -> Self {
        self.model.schema = Some(schema);
        self
    }

    pub fn build(self) -> Model {
        self.model
    }
}

/// Run model code, turning a panic into an error
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow::anyhow!("model panicked: {message}"))
        }
    }
}
