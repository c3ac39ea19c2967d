// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The model wrapper: a uniform, failure-tolerant async surface over a [`Model`].
//!
//! Predict, train and warm run on a [`CancellablePool`] of workers, either child
//! processes (the default) or dedicated threads. Awaiting a pool job is the only point
//! where the wrapper suspends. Metadata and argument declarations are read directly
//! and never fail; missing or broken implementations yield placeholders.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

use modelserve_runtime::pool::{
    CancellablePool, PoolError, ProcessWorkerFactory, ThreadWorkerFactory, WorkerCommand,
};
use modelserve_runtime::Runtime;

use crate::args::{Arg, Args, RequestArg, RequestArgs};
use crate::errors::ModelError;
use crate::files::ReturnedFile;
use crate::job::{discard_result, JobFault, JobOutput, JobResult, ModelJob, ModelJobHandler};
use crate::model::{catch_panic, Capabilities, Model, ModelMethod, NotImplemented};
use crate::schema::{ArgSpecs, ResponseValidator};

/// How pool workers are isolated from each other and from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One child process per worker; required for models holding native state
    #[default]
    Process,
    /// One thread per worker, sharing the model; stuck threads can only be detached
    Thread,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Process => f.write_str("process"),
            Isolation::Thread => f.write_str("thread"),
        }
    }
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Isolation::Process),
            "thread" => Ok(Isolation::Thread),
            other => anyhow::bail!("unknown isolation '{other}', expected process or thread"),
        }
    }
}

#[derive(Debug, Clone, Builder)]
pub struct WrapperOptions {
    /// Number of pool workers
    #[builder(default = "1")]
    pub workers: usize,

    #[builder(default)]
    pub isolation: Isolation,

    /// How long a cancelled worker may take to stop before it is killed
    #[builder(default = "Duration::from_secs(5)")]
    pub cancel_grace: Duration,

    #[builder(default = "Duration::from_secs(60)")]
    pub worker_start_timeout: Duration,

    /// Command starting a process worker for this model. Required for process isolation.
    #[builder(default, setter(strip_option))]
    pub worker_command: Option<WorkerCommand>,
}

impl Default for WrapperOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            isolation: Isolation::default(),
            cancel_grace: Duration::from_secs(5),
            worker_start_timeout: Duration::from_secs(60),
            worker_command: None,
        }
    }
}

impl WrapperOptions {
    pub fn builder() -> WrapperOptionsBuilder {
        WrapperOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    Uninitialized,
    Ready,
    ShutDown,
}

/// What a prediction returns to the HTTP layer
#[derive(Debug, Clone, PartialEq)]
pub enum PredictResponse {
    Json(Value),
    File(ReturnedFile),
}

type ThreadMake = Box<dyn Fn(usize) -> anyhow::Result<ModelJobHandler> + Send + Sync>;
type ThreadPool = CancellablePool<ThreadWorkerFactory<ModelJobHandler, ThreadMake>>;
type ProcessPool = CancellablePool<ProcessWorkerFactory<ModelJob, JobResult>>;

// Thread pool futures are boxed where their concrete type is known: rustc cannot prove
// them `Send` once nested in another future, as the boxed `dyn Fn`'s lifetime is erased.
type SendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone)]
enum WorkerPool {
    Thread(ThreadPool),
    Process(ProcessPool),
}

impl WorkerPool {
    async fn start(name: &str, model: &Arc<Model>, options: &WrapperOptions) -> anyhow::Result<Self> {
        match options.isolation {
            Isolation::Thread => {
                let shared = model.clone();
                let model_name = name.to_string();
                let make: ThreadMake = Box::new(move |_slot: usize| {
                    Ok(ModelJobHandler::new(model_name.clone(), shared.clone()))
                });
                let factory = ThreadWorkerFactory::new(format!("model-{name}"), make);
                let pool = CancellablePool::new(factory, options.workers, options.cancel_grace).await?;
                Ok(WorkerPool::Thread(pool))
            }
            Isolation::Process => {
                let command = options.worker_command.clone().ok_or_else(|| {
                    anyhow::anyhow!("process isolation needs a worker command for model '{name}'")
                })?;
                let factory = ProcessWorkerFactory::new(command, options.worker_start_timeout)
                    .with_discard(discard_result);
                let pool = CancellablePool::new(factory, options.workers, options.cancel_grace).await?;
                Ok(WorkerPool::Process(pool))
            }
        }
    }

    async fn apply(&self, job: ModelJob, cancel: &CancellationToken) -> Result<JobResult, PoolError> {
        match self {
            WorkerPool::Thread(pool) => {
                let fut: SendFuture<'_, _> = Box::pin(pool.apply(job, cancel));
                fut.await
            }
            WorkerPool::Process(pool) => pool.apply(job, cancel).await,
        }
    }

    async fn broadcast(&self, job: ModelJob) -> Vec<Result<JobResult, PoolError>> {
        match self {
            WorkerPool::Thread(pool) => {
                let fut: SendFuture<'_, _> = Box::pin(pool.broadcast(|_| job.clone()));
                fut.await
            }
            WorkerPool::Process(pool) => pool.broadcast(|_| job.clone()).await,
        }
    }

    fn size(&self) -> usize {
        match self {
            WorkerPool::Thread(pool) => pool.size(),
            WorkerPool::Process(pool) => pool.size(),
        }
    }

    fn available(&self) -> usize {
        match self {
            WorkerPool::Thread(pool) => pool.available(),
            WorkerPool::Process(pool) => pool.available(),
        }
    }

    async fn shutdown(&self) {
        match self {
            WorkerPool::Thread(pool) => {
                let fut: SendFuture<'_, _> = Box::pin(pool.shutdown());
                fut.await
            }
            WorkerPool::Process(pool) => pool.shutdown().await,
        }
    }
}

pub struct ModelWrapper {
    name: String,
    model: Arc<Model>,
    validator: Option<ResponseValidator>,
    pool: WorkerPool,
    options: WrapperOptions,
    state: Arc<Mutex<WrapperState>>,
}

impl fmt::Debug for ModelWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelWrapper")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("isolation", &self.options.isolation)
            .field("workers", &self.pool.size())
            .field("available", &self.pool.available())
            .finish()
    }
}

impl ModelWrapper {
    /// Wrap `model` and start its worker pool. The pool is shut down by `runtime`'s
    /// shutdown, or earlier by [`ModelWrapper::shutdown`].
    ///
    /// Fails with [`ModelError::InvalidSchema`] when the model's schema cannot be used.
    pub async fn new(
        name: impl Into<String>,
        model: Model,
        runtime: &Runtime,
        options: WrapperOptions,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let state = Arc::new(Mutex::new(WrapperState::Uninitialized));

        let validator = match model.schema.clone() {
            Some(spec) => Some(ResponseValidator::from_spec(spec).map_err(|reason| {
                tracing::error!(model = %name, %reason, "Model defined schema is invalid");
                ModelError::InvalidSchema {
                    model: name.clone(),
                    reason,
                }
            })?),
            None => None,
        };

        let model = Arc::new(model);
        let pool = WorkerPool::start(&name, &model, &options).await?;

        {
            let pool = pool.clone();
            let state = state.clone();
            runtime.on_shutdown(format!("model {name}"), move || async move {
                *state.lock() = WrapperState::ShutDown;
                pool.shutdown().await;
            });
        }

        *state.lock() = WrapperState::Ready;
        tracing::info!(
            model = %name,
            isolation = %options.isolation,
            workers = options.workers,
            schema = validator.is_some(),
            "Model loaded"
        );

        Ok(Self {
            name,
            model,
            validator,
            pool,
            options,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WrapperState {
        *self.state.lock()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.model.capabilities()
    }

    pub fn has_schema(&self) -> bool {
        self.validator.is_some()
    }

    pub fn options(&self) -> &WrapperOptions {
        &self.options
    }

    /// Free worker slots
    pub fn available_workers(&self) -> usize {
        self.pool.available()
    }

    /// The model's metadata, or a placeholder when it cannot be obtained
    pub fn get_metadata(&self) -> Value {
        let placeholder = || {
            json!({
                "id": "0",
                "name": self.name,
                "description": format!(
                    "Could not load description from underlying model (loaded '{}')",
                    self.name
                ),
            })
        };

        match self.model.metadata() {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(other) => {
                tracing::warn!(model = %self.name, "Model metadata is not an object: {}", other);
                placeholder()
            }
            Err(err) if err.is::<NotImplemented>() => placeholder(),
            Err(err) => {
                tracing::warn!(model = %self.name, error = format!("{err:#}"), "Failed to load model metadata");
                placeholder()
            }
        }
    }

    pub fn get_predict_args(&self) -> ArgSpecs {
        self.arg_specs(ModelMethod::PredictArgs)
    }

    pub fn get_train_args(&self) -> ArgSpecs {
        self.arg_specs(ModelMethod::TrainArgs)
    }

    fn arg_specs(&self, method: ModelMethod) -> ArgSpecs {
        let handler = match method {
            ModelMethod::PredictArgs => self.model.predict_args.as_ref(),
            _ => self.model.train_args.as_ref(),
        };
        let Some(handler) = handler else {
            return ArgSpecs::new();
        };
        match catch_panic(handler) {
            Ok(specs) => specs,
            Err(err) if err.is::<NotImplemented>() => ArgSpecs::new(),
            Err(err) => {
                tracing::warn!(model = %self.name, %method, error = format!("{err:#}"), "Failed to load argument declarations");
                ArgSpecs::new()
            }
        }
    }

    /// Run a prediction. Uploaded files are staged for the duration of the call.
    ///
    /// JSON results are validated against the schema when there is one, and wrapped as
    /// `{"status": "OK", "predictions": ...}` when there is not.
    pub async fn predict(
        &self,
        args: RequestArgs,
        cancel: &CancellationToken,
    ) -> Result<PredictResponse, ModelError> {
        let method = ModelMethod::Predict;
        self.ensure_ready()?;
        if self.model.predict.is_none() {
            return Err(self.not_implemented(method));
        }

        let (args, _uploads) = self.stage(method, args).await?;
        let output = self.dispatch(method, ModelJob::Predict { args }, cancel).await?;

        match output {
            JobOutput::File { file } => Ok(PredictResponse::File(file)),
            JobOutput::Json { value } if self.has_schema() => {
                self.validate_response(&value)?;
                Ok(PredictResponse::Json(value))
            }
            JobOutput::Json { value } => Ok(PredictResponse::Json(json!({
                "status": "OK",
                "predictions": value,
            }))),
            JobOutput::Done => Ok(PredictResponse::Json(json!({
                "status": "OK",
                "predictions": Value::Null,
            }))),
        }
    }

    pub async fn train(
        &self,
        args: RequestArgs,
        cancel: &CancellationToken,
    ) -> Result<Value, ModelError> {
        let method = ModelMethod::Train;
        self.ensure_ready()?;
        if self.model.train.is_none() {
            return Err(self.not_implemented(method));
        }

        let (args, _uploads) = self.stage(method, args).await?;
        match self.dispatch(method, ModelJob::Train { args }, cancel).await? {
            JobOutput::Json { value } => Ok(value),
            JobOutput::Done => Ok(Value::Null),
            JobOutput::File { file } => {
                tracing::warn!(model = %self.name, "Discarding file returned by train");
                file.discard();
                Ok(Value::Null)
            }
        }
    }

    /// Warm every worker once. Models without a warm step are accepted silently.
    pub async fn warm(&self) -> Result<(), ModelError> {
        let method = ModelMethod::Warm;
        self.ensure_ready()?;
        if self.model.warm.is_none() {
            tracing::debug!(model = %self.name, "Model has no warm step");
            return Ok(());
        }

        tracing::debug!(model = %self.name, workers = self.pool.size(), "Warming model");
        for result in self.pool.broadcast(ModelJob::Warm).await {
            match self.convert(method, result) {
                Ok(_) => {}
                Err(ModelError::MethodNotImplemented { .. }) => {
                    tracing::debug!(model = %self.name, "Cannot warm (initialize) model");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        tracing::info!(model = %self.name, "Model has been warmed");
        Ok(())
    }

    /// Check `payload` against the model's response schema.
    pub fn validate_response(&self, payload: &Value) -> Result<bool, ModelError> {
        let Some(validator) = &self.validator else {
            return Err(ModelError::MissingModelSchema {
                model: self.name.clone(),
            });
        };

        match validator.validate(payload) {
            Ok(()) => Ok(true),
            Err(problems) => {
                tracing::error!(
                    model = %self.name,
                    ?problems,
                    "Model response does not match its schema"
                );
                Err(ModelError::ResponseValidation {
                    model: self.name.clone(),
                    problems,
                })
            }
        }
    }

    /// Stop every worker. Later calls fail with [`ModelError::ShutDown`].
    pub async fn shutdown(&self) {
        let first = {
            let mut state = self.state.lock();
            let first = *state != WrapperState::ShutDown;
            *state = WrapperState::ShutDown;
            first
        };
        if first {
            tracing::info!(model = %self.name, "Shutting down model workers");
        }
        self.pool.shutdown().await;
    }

    fn ensure_ready(&self) -> Result<(), ModelError> {
        match self.state() {
            WrapperState::Ready => Ok(()),
            _ => Err(ModelError::ShutDown {
                model: self.name.clone(),
            }),
        }
    }

    fn not_implemented(&self, method: ModelMethod) -> ModelError {
        ModelError::MethodNotImplemented {
            model: self.name.clone(),
            method,
        }
    }

    async fn stage(
        &self,
        method: ModelMethod,
        args: RequestArgs,
    ) -> Result<(Args, Vec<TempPath>), ModelError> {
        let mut staged = Args::new();
        let mut uploads = Vec::new();
        for (name, arg) in args {
            match arg {
                RequestArg::Value(value) => {
                    staged.insert(name, Arg::Value(value));
                }
                RequestArg::File(field) => {
                    let (upload, guard) = field.stage().await.map_err(|err| {
                        let err = anyhow::Error::new(err).context("failed to stage uploaded file");
                        ModelError::unexpected(&self.name, method, &err)
                    })?;
                    uploads.push(guard);
                    staged.insert(name, Arg::File(upload));
                }
            }
        }
        Ok((staged, uploads))
    }

    async fn dispatch(
        &self,
        method: ModelMethod,
        job: ModelJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, ModelError> {
        let result = self.pool.apply(job, cancel).await;
        self.convert(method, result)
    }

    fn convert(
        &self,
        method: ModelMethod,
        result: Result<JobResult, PoolError>,
    ) -> Result<JobOutput, ModelError> {
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(JobFault::NotImplemented)) => Err(self.not_implemented(method)),
            Ok(Err(JobFault::Cancelled)) | Err(PoolError::Cancelled) => {
                tracing::info!(model = %self.name, %method, "Model call cancelled");
                Err(ModelError::Cancelled)
            }
            Ok(Err(JobFault::Failed { reference })) => {
                Err(ModelError::with_reference(&self.name, method, &reference))
            }
            Err(PoolError::ShutDown) => Err(ModelError::ShutDown {
                model: self.name.clone(),
            }),
            Err(err) => Err(ModelError::unexpected(
                &self.name,
                method,
                &anyhow::Error::new(err),
            )),
        }
    }
}
