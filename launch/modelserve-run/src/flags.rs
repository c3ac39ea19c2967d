// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use modelserve_model::{Isolation, ServiceConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "modelserve",
    version,
    about = "Serve a machine learning model over a uniform HTTP API"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP service (the default)
    Serve(ServeFlags),

    /// Run a single prediction from the command line and print the result
    Predict(PredictFlags),

    /// Train the model once in the foreground and print the result
    Train(TrainFlags),

    /// Run the model's warm-up step
    Warm(ModelFlags),

    /// Print the model's metadata
    Metadata(ModelFlags),

    /// List the registered models
    Models,

    /// Serve model jobs over stdin/stdout. Started by the service for process isolation.
    #[command(hide = true)]
    Worker(WorkerFlags),
}

impl Default for Command {
    fn default() -> Self {
        Command::Serve(ServeFlags::default())
    }
}

/// Options overriding the configuration file and `MODELSERVE_*` environment
#[derive(Args, Debug, Clone, Default)]
pub struct ServeFlags {
    /// TOML configuration file. Defaults to the file named by MODELSERVE_CONFIG.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Model to serve. Optional when exactly one model is registered.
    #[arg(long)]
    pub model: Option<String>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Number of model workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Where model code runs: process or thread
    #[arg(long)]
    pub isolation: Option<Isolation>,

    /// How long a cancelled worker may keep running before it is killed, e.g. "5s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub cancel_grace: Option<Duration>,

    /// Skip warming the model before serving
    #[arg(long)]
    pub no_warm: bool,

    /// Serve captured log output on /debug
    #[arg(long)]
    pub debug_endpoint: bool,

    /// Do not serve /openapi.json and /docs
    #[arg(long)]
    pub no_docs: bool,

    /// Largest accepted request body in bytes, 0 for unlimited
    #[arg(long)]
    pub client_max_size: Option<usize>,
}

impl ServeFlags {
    /// Load the configuration, then apply the flags given on the command line.
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::from_settings_with(self.config.as_deref())?;
        self.apply(&mut config);
        validator::Validate::validate(&config)?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut ServiceConfig) {
        if let Some(model) = &self.model {
            config.model_name = Some(model.clone());
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(isolation) = self.isolation {
            config.isolation = isolation;
        }
        if let Some(grace) = self.cancel_grace {
            config.cancel_grace_secs = grace.as_secs();
        }
        if let Some(size) = self.client_max_size {
            config.client_max_size = size;
        }
        if self.no_warm {
            config.warm = false;
        }
        if self.debug_endpoint {
            config.debug_endpoint = true;
        }
        if self.no_docs {
            config.doc_endpoint = false;
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModelFlags {
    /// Model to run. Optional when exactly one model is registered.
    #[arg(long, env = "MODELSERVE_MODEL")]
    pub model: Option<String>,
}

/// Arguments of a model call
#[derive(Args, Debug, Clone, Default)]
pub struct InputFlags {
    /// Argument as name=value, repeatable
    #[arg(long = "arg", value_parser = parse_key_val)]
    pub args: Vec<(String, String)>,

    /// File argument as name=path, repeatable
    #[arg(long = "file", value_parser = parse_key_path)]
    pub files: Vec<(String, PathBuf)>,
}

#[derive(Args, Debug, Clone)]
pub struct PredictFlags {
    #[command(flatten)]
    pub model: ModelFlags,

    #[command(flatten)]
    pub inputs: InputFlags,

    /// Write a file result here instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct TrainFlags {
    #[command(flatten)]
    pub model: ModelFlags,

    #[command(flatten)]
    pub inputs: InputFlags,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerFlags {
    #[arg(long)]
    pub model: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected name=value, got '{s}'")),
    }
}

fn parse_key_path(s: &str) -> Result<(String, PathBuf), String> {
    parse_key_val(s).map(|(key, path)| (key, PathBuf::from(path)))
}
