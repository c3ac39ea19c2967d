// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Modelserve runtime: process lifecycle, configuration, logging and the
//! cancellable worker pool that isolates model code.

pub use anyhow::{
    anyhow as error, bail as raise, Context as ErrorContext, Error, Ok as OK, Result,
};

pub mod config;
pub use config::RuntimeConfig;

pub mod logging;
pub mod pool;
pub mod runtime;
pub mod utils;

pub use pool::{CancellablePool, PoolError};
pub use runtime::Runtime;
pub use tokio_util::sync::CancellationToken;
