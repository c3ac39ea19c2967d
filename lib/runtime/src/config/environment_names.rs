// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable names read by modelserve.
//!
//! Organized by functional area:
//! - **Logging**: log level, format and filter file
//! - **Runtime**: Tokio runtime sizing and shutdown
//! - **Service**: the serving process (model selection, pool, HTTP)
//! - **Worker**: variables handed to pool worker processes

/// Logging and tracing environment variables
pub mod logging {
    /// Log filter directives (e.g., "debug", "modelserve_model=trace")
    pub const MODELSERVE_LOG: &str = "MODELSERVE_LOG";

    /// Path to a TOML logging configuration file
    pub const MODELSERVE_LOGGING_CONFIG_PATH: &str = "MODELSERVE_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const MODELSERVE_LOGGING_JSONL: &str = "MODELSERVE_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const MODELSERVE_DISABLE_ANSI_LOGGING: &str = "MODELSERVE_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const MODELSERVE_LOG_USE_LOCAL_TZ: &str = "MODELSERVE_LOG_USE_LOCAL_TZ";
}

/// Tokio runtime environment variables
pub mod runtime {
    /// Number of async worker threads for the Tokio runtime
    pub const MODELSERVE_RUNTIME_NUM_WORKER_THREADS: &str = "MODELSERVE_RUNTIME_NUM_WORKER_THREADS";

    /// Maximum number of blocking threads for the Tokio runtime
    pub const MODELSERVE_RUNTIME_MAX_BLOCKING_THREADS: &str =
        "MODELSERVE_RUNTIME_MAX_BLOCKING_THREADS";

    /// Seconds to wait for in-flight requests during shutdown
    pub const MODELSERVE_RUNTIME_GRACEFUL_SHUTDOWN_TIMEOUT: &str =
        "MODELSERVE_RUNTIME_GRACEFUL_SHUTDOWN_TIMEOUT";
}

/// Serving process environment variables
pub mod service {
    /// Prefix shared by every service setting, e.g. `MODELSERVE_WORKERS`
    pub const PREFIX: &str = "MODELSERVE_";

    /// Path to a TOML service configuration file
    pub const MODELSERVE_CONFIG: &str = "MODELSERVE_CONFIG";

    /// Name of the model to serve when several are registered
    pub const MODELSERVE_MODEL: &str = "MODELSERVE_MODEL";

    /// Listen address
    pub const MODELSERVE_HOST: &str = "MODELSERVE_HOST";

    /// Listen port
    pub const MODELSERVE_PORT: &str = "MODELSERVE_PORT";

    /// Size of the model worker pool
    pub const MODELSERVE_WORKERS: &str = "MODELSERVE_WORKERS";

    /// Whether to warm the model before serving
    pub const MODELSERVE_WARM: &str = "MODELSERVE_WARM";

    /// Worker isolation: "process" or "thread"
    pub const MODELSERVE_ISOLATION: &str = "MODELSERVE_ISOLATION";

    /// Maximum request body size in bytes, 0 for unlimited
    pub const MODELSERVE_CLIENT_MAX_SIZE: &str = "MODELSERVE_CLIENT_MAX_SIZE";

    /// Expose the captured log output on /debug
    pub const MODELSERVE_DEBUG_ENDPOINT: &str = "MODELSERVE_DEBUG_ENDPOINT";
}

/// Variables set by the pool on worker processes
pub mod worker {
    /// Slot index the worker process occupies
    pub const MODELSERVE_WORKER_SLOT: &str = "MODELSERVE_WORKER_SLOT";
}
