// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use modelserve_runtime::config::environment_names::service::{MODELSERVE_CONFIG, PREFIX};
use modelserve_runtime::pool::WorkerCommand;

use crate::wrapper::{Isolation, WrapperOptions};

/// Configuration of the serving process: HTTP listener, model selection and worker pool.
///
/// Layered from defaults, the TOML file named by `MODELSERVE_CONFIG`, then
/// `MODELSERVE_`-prefixed environment variables such as `MODELSERVE_PORT`.
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
pub struct ServiceConfig {
    #[validate(length(min = 1))]
    #[builder(default = "\"127.0.0.1\".to_string()", setter(into))]
    pub host: String,

    #[validate(range(min = 1))]
    #[builder(default = "5000")]
    pub port: u16,

    /// Size of the model worker pool
    #[validate(range(min = 1))]
    #[builder(default = "1")]
    pub workers: usize,

    /// Warm the model before serving
    #[builder(default = "true")]
    pub warm: bool,

    /// Model to serve. Set with MODELSERVE_MODEL.
    #[builder(default, setter(into, strip_option))]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub model_name: Option<String>,

    /// Maximum request body size in bytes, 0 for unlimited
    #[builder(default = "0")]
    pub client_max_size: usize,

    #[builder(default)]
    pub isolation: Isolation,

    /// Seconds a cancelled worker gets before it is killed
    #[builder(default = "5")]
    pub cancel_grace_secs: u64,

    #[validate(range(min = 1))]
    #[builder(default = "60")]
    pub worker_start_timeout_secs: u64,

    #[builder(default = "true")]
    pub predict_endpoint: bool,

    #[builder(default = "true")]
    pub train_endpoint: bool,

    /// Serve /openapi.json and /docs
    #[builder(default = "true")]
    pub doc_endpoint: bool,

    /// Serve captured log output on /debug
    #[builder(default = "false")]
    pub debug_endpoint: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            workers: 1,
            warm: true,
            model_name: None,
            client_max_size: 0,
            isolation: Isolation::default(),
            cancel_grace_secs: 5,
            worker_start_timeout_secs: 60,
            predict_endpoint: true,
            train_endpoint: true,
            doc_endpoint: true,
            debug_endpoint: false,
        }
    }
}

impl fmt::Display for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listen={}, ", self.bind_address())?;
        match &self.model_name {
            Some(name) => write!(f, "model={name}, ")?,
            None => write!(f, "model=auto, ")?,
        }
        write!(
            f,
            "workers={}, isolation={}, cancel_grace={}s",
            self.workers, self.isolation, self.cancel_grace_secs
        )
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    pub(crate) fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(ServiceConfig::default()));

        match config_file {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                if let Ok(path) = std::env::var(MODELSERVE_CONFIG) {
                    if !path.is_empty() {
                        figment = figment.merge(Toml::file(path));
                    }
                }
            }
        }

        figment.merge(Env::prefixed(PREFIX).filter_map(|k| {
            let full_key = format!("{PREFIX}{}", k.as_str());
            // filters out empty environment variables
            match std::env::var(&full_key) {
                Ok(v) if !v.is_empty() => {}
                _ => return None,
            }
            if k.as_str().eq_ignore_ascii_case("model") {
                Some("model_name".into())
            } else {
                Some(k.into())
            }
        }))
    }

    /// Load the service configuration from the config file and environment.
    pub fn from_settings() -> Result<ServiceConfig> {
        Self::from_settings_with(None)
    }

    /// Like [`ServiceConfig::from_settings`], reading `config_file` instead of the file
    /// named by `MODELSERVE_CONFIG`. The file must exist.
    pub fn from_settings_with(config_file: Option<&Path>) -> Result<ServiceConfig> {
        if let Some(path) = config_file {
            anyhow::ensure!(path.is_file(), "config file {} not found", path.display());
        }
        let config: ServiceConfig = Self::figment(config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn worker_start_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_start_timeout_secs)
    }

    /// Wrapper options for this configuration. `worker_command` is only used with
    /// process isolation.
    pub fn wrapper_options(&self, worker_command: Option<WorkerCommand>) -> WrapperOptions {
        WrapperOptions {
            workers: self.workers,
            isolation: self.isolation,
            cancel_grace: self.cancel_grace(),
            worker_start_timeout: self.worker_start_timeout(),
            worker_command,
        }
    }
}

impl ServiceConfigBuilder {
    /// Build and validate the service configuration
    pub fn build(&self) -> Result<ServiceConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}
