// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Modelserve model library
//!
//! Wraps a pluggable [`Model`] so it can be served over HTTP: the capability
//! contract, argument and response validation, the [`ModelWrapper`] running model
//! code on a cancellable worker pool, the model registry, and the axum service.

pub mod args;
pub mod config;
pub mod errors;
pub mod files;
pub mod http;
pub mod job;
pub mod model;
pub mod registry;
pub mod schema;
pub mod test_model;
pub mod wrapper;

pub use args::{parse_args, Arg, Args, RawInput, RequestArg, RequestArgs};
pub use config::ServiceConfig;
pub use errors::{ModelError, RegistryError};
pub use files::{FileField, ReturnedFile, UploadedFile};
pub use model::{Cancelled, Capabilities, Model, ModelBuilder, ModelMethod, NotImplemented, Output};
pub use registry::{ModelManager, ModelRegistry};
pub use schema::{ArgSpecs, Field, FieldKind, Location, ResponseSchema, SchemaSpec};
pub use wrapper::{Isolation, ModelWrapper, PredictResponse, WrapperOptions, WrapperState};
