// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The `modelserve` command line.
//!
//! A binary serving its own models calls [`main_with`] with a registry holding them.
//! Process isolation starts workers by re-running the same binary with the hidden
//! `worker` subcommand, so they see the same registry.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use modelserve_model::http::service::service_v2::HttpService;
use modelserve_model::job::ModelJobHandler;
use modelserve_model::{
    parse_args, FileField, Isolation, ModelManager, ModelRegistry, ModelWrapper, PredictResponse,
    RawInput, WrapperOptions,
};
use modelserve_runtime::logging::{self, LoggingOptions};
use modelserve_runtime::pool::{process, WorkerCommand};
use modelserve_runtime::{Runtime, RuntimeConfig};
use tokio_util::sync::CancellationToken;

mod flags;
pub use flags::{
    Cli, Command, InputFlags, ModelFlags, PredictFlags, ServeFlags, TrainFlags, WorkerFlags,
};

/// Parse the command line and run it on a new Tokio runtime.
pub fn main_with(registry: ModelRegistry) -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_settings()?.create_runtime()?;
    runtime.block_on(run(cli, registry))
}

pub async fn run(cli: Cli, registry: ModelRegistry) -> anyhow::Result<()> {
    match cli.command.unwrap_or_default() {
        Command::Serve(flags) => serve(flags, registry).await,
        Command::Predict(flags) => predict(flags, registry).await,
        Command::Train(flags) => train(flags, registry).await,
        Command::Warm(flags) => warm(flags, registry).await,
        Command::Metadata(flags) => metadata(flags, registry).await,
        Command::Models => {
            logging::init();
            list_models(&registry)
        }
        Command::Worker(flags) => worker(flags, registry).await,
    }
}

/// How process-isolated workers of `model` are started
pub fn worker_command(model: &str) -> anyhow::Result<WorkerCommand> {
    Ok(WorkerCommand::current_exe()
        .context("cannot locate the current executable to start workers")?
        .args(["worker", "--model", model]))
}

async fn serve(flags: ServeFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    let config = flags.service_config()?;
    logging::init_with(LoggingOptions {
        capture_debug: config.debug_endpoint,
    });
    tracing::info!("Starting modelserve: {config}");

    let runtime = Runtime::from_settings()?;
    let name = registry.resolve_name(config.model_name.as_deref())?;
    let command = match config.isolation {
        Isolation::Process => Some(worker_command(&name)?),
        Isolation::Thread => None,
    };

    let manager = ModelManager::new(registry);
    let wrapper = match manager
        .load(&name, &runtime, config.wrapper_options(command))
        .await
    {
        Ok(wrapper) => wrapper,
        Err(err) => {
            runtime.shutdown().await;
            return Err(err.context(format!("failed to load model '{name}'")));
        }
    };

    if config.warm {
        if let Err(err) = wrapper.warm().await {
            runtime.shutdown().await;
            return Err(anyhow::Error::from(err).context("failed to warm the model"));
        }
    }

    let service = HttpService::builder()
        .with_service_config(&config)
        .wrapper(wrapper)
        .debug_buffer(logging::debug_buffer())
        .shutdown_tracker(Some(runtime.graceful_shutdown_tracker()))
        .build()?;

    tracing::info!(
        model = %name,
        routes = service.route_docs().len(),
        "Serving on http://{}:{}",
        service.host(),
        service.port()
    );
    let mut server = service.spawn(runtime.child_token()).await;
    let finished = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            None
        }
        joined = &mut server => Some(joined),
    };

    runtime.shutdown().await;
    let joined = match finished {
        Some(joined) => joined,
        None => server.await,
    };
    joined.context("HTTP service task failed")?
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Load a model on thread workers for a one-off command line call.
async fn load_local(
    flags: &ModelFlags,
    registry: &ModelRegistry,
) -> anyhow::Result<(Runtime, ModelWrapper)> {
    logging::init();
    let runtime = Runtime::from_settings()?;
    let (name, model) = registry.resolve_model(flags.model.as_deref())?;

    let options = WrapperOptions::builder()
        .isolation(Isolation::Thread)
        .build()?;
    match ModelWrapper::new(name, model, &runtime, options).await {
        Ok(wrapper) => Ok((runtime, wrapper)),
        Err(err) => {
            runtime.shutdown().await;
            Err(err)
        }
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn predict(flags: PredictFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    let (runtime, wrapper) = load_local(&flags.model, &registry).await?;
    let outcome = predict_once(&wrapper, &flags.inputs).await;
    runtime.shutdown().await;

    match outcome? {
        PredictResponse::Json(value) => print_json(&value)?,
        PredictResponse::File(file) => {
            let data = file.take().await?;
            match &flags.output {
                Some(path) => {
                    tokio::fs::write(path, &data)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!("Prediction written to {}", path.display());
                }
                None => std::io::stdout().write_all(&data)?,
            }
        }
    }
    Ok(())
}

async fn predict_once(
    wrapper: &ModelWrapper,
    inputs: &InputFlags,
) -> anyhow::Result<PredictResponse> {
    let args = parse_args(&wrapper.get_predict_args(), raw_inputs(inputs).await?)?;
    Ok(wrapper.predict(args, &CancellationToken::new()).await?)
}

async fn train(flags: TrainFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    let (runtime, wrapper) = load_local(&flags.model, &registry).await?;
    let outcome = async {
        let args = parse_args(&wrapper.get_train_args(), raw_inputs(&flags.inputs).await?)?;
        anyhow::Ok(wrapper.train(args, &runtime.child_token()).await?)
    }
    .await;
    runtime.shutdown().await;

    print_json(&serde_json::json!({ "result": outcome? }))
}

async fn warm(flags: ModelFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    let (runtime, wrapper) = load_local(&flags, &registry).await?;
    let outcome = wrapper.warm().await;
    runtime.shutdown().await;

    outcome.context("failed to warm the model")?;
    tracing::info!(model = wrapper.name(), "Model is warm");
    Ok(())
}

async fn metadata(flags: ModelFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    let (runtime, wrapper) = load_local(&flags, &registry).await?;
    let metadata = wrapper.get_metadata();
    runtime.shutdown().await;
    print_json(&metadata)
}

/// Command line arguments and files as request inputs. File content types are guessed
/// from their extension.
async fn raw_inputs(flags: &InputFlags) -> anyhow::Result<Vec<(String, RawInput)>> {
    let mut inputs: Vec<(String, RawInput)> = flags
        .args
        .iter()
        .map(|(name, value)| (name.clone(), RawInput::Text(value.clone())))
        .collect();

    for (name, path) in &flags.files {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned());
        let content_type = mime_guess::from_path(path).first().map(|mime| mime.to_string());
        inputs.push((
            name.clone(),
            RawInput::File(FileField::new(name.clone(), filename, content_type, file)),
        ));
    }
    Ok(inputs)
}

fn list_models(registry: &ModelRegistry) -> anyhow::Result<()> {
    let selected = registry.resolve_name(None).ok();
    let models: Vec<serde_json::Value> = registry
        .names()
        .into_iter()
        .map(|name| {
            let metadata = match registry.load(&name).map(|model| model.metadata()) {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(err)) => {
                    tracing::debug!(model = %name, error = %err, "No metadata");
                    serde_json::Value::Null
                }
                Err(err) => {
                    tracing::warn!(model = %name, error = %err, "Cannot build model");
                    serde_json::Value::Null
                }
            };
            serde_json::json!({ "name": name, "metadata": metadata })
        })
        .collect();

    let listing = serde_json::json!({
        "models": models,
        "default": selected,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Worker process entry point: build the model, then serve jobs until stdin closes.
async fn worker(flags: WorkerFlags, registry: ModelRegistry) -> anyhow::Result<()> {
    logging::init();
    let model = match registry.load(&flags.model) {
        Ok(model) => model,
        Err(err) => {
            let err = anyhow::Error::from(err);
            process::report_startup_failure(&err).await?;
            return Err(err);
        }
    };

    tracing::debug!(model = %flags.model, pid = std::process::id(), "Worker started");
    process::serve(ModelJobHandler::new(flags.model, Arc::new(model))).await
}
