// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background training with history and cancellation.
//!
//! ## Endpoints
//!
//! ### POST /v2/models/{name}/train
//!
//! Start a training run with the model's training arguments. Returns the new record:
//! ```json
//! {"uuid": "0f0e...", "date": "2025-01-01T10:00:00Z", "status": "running"}
//! ```
//!
//! ### GET /v2/models/{name}/train
//!
//! List every training run of this process, oldest first.
//!
//! ### GET /v2/models/{name}/train/{uuid}
//!
//! Return one training record.
//!
//! ### DELETE /v2/models/{name}/train/{uuid}
//!
//! Cancel a running training. Waits for the worker to stop, at most the wrapper's
//! cancel grace period, and returns the record.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{json_error_middleware, HttpError};
use super::versions::API_VERSION;
use super::{input, service_v2, RouteDoc};
use crate::args::{parse_args, RequestArgs};
use crate::errors::ModelError;
use crate::wrapper::ModelWrapper;

/// Extra time allowed past the cancel grace period for the worker to be killed
const KILL_MARGIN: Duration = Duration::from_secs(1);

/// Finished trainings older than this are forgotten
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Most finished trainings kept, the oldest are forgotten first
const DEFAULT_MAX_FINISHED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Running,
    Error,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub uuid: String,
    pub date: DateTime<Utc>,
    pub status: TrainingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

struct Training {
    record: TrainingRecord,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
    finished_at: Option<DateTime<Utc>>,
}

/// Training runs started by this process.
///
/// Running trainings are always kept. Finished ones are evicted once they are older
/// than the retention window or exceed the maximum count.
pub struct TrainingHistory {
    trainings: DashMap<String, Training>,
    retention: Duration,
    max_finished: usize,
}

impl Default for TrainingHistory {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION, DEFAULT_MAX_FINISHED)
    }
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration, max_finished: usize) -> Self {
        Self {
            trainings: DashMap::new(),
            retention,
            max_finished,
        }
    }

    /// Start training in the background and return its record.
    pub fn start(self: &Arc<Self>, wrapper: Arc<ModelWrapper>, args: RequestArgs) -> TrainingRecord {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let record = TrainingRecord {
            uuid: uuid.clone(),
            date: Utc::now(),
            status: TrainingStatus::Running,
            message: None,
            result: None,
        };
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);

        self.trainings.insert(
            uuid.clone(),
            Training {
                record: record.clone(),
                cancel: cancel.clone(),
                finished: finished_rx,
                finished_at: None,
            },
        );

        let history = self.clone();
        tokio::spawn(async move {
            tracing::info!(training = %uuid, model = wrapper.name(), "Training started");
            let outcome = wrapper.train(args, &cancel).await;
            history.finish(&uuid, outcome);
            let _ = finished_tx.send(true);
        });

        record
    }

    fn finish(&self, uuid: &str, outcome: Result<Value, ModelError>) {
        {
            let Some(mut training) = self.trainings.get_mut(uuid) else {
                return;
            };
            training.finished_at = Some(Utc::now());
            Self::settle(uuid, &mut training.record, outcome);
        }
        self.evict();
    }

    fn settle(uuid: &str, record: &mut TrainingRecord, outcome: Result<Value, ModelError>) {
        match outcome {
            Ok(result) => {
                record.status = TrainingStatus::Completed;
                if !result.is_null() {
                    record.result = Some(result);
                }
            }
            Err(ModelError::Cancelled) => {
                record.status = TrainingStatus::Cancelled;
                record.message = Some("training was cancelled".to_string());
            }
            Err(err) => {
                record.status = TrainingStatus::Error;
                record.message = Some(err.to_string());
            }
        }
        tracing::info!(training = %uuid, status = ?record.status, "Training finished");
    }

    /// Forget finished trainings past the retention window, then the oldest ones over
    /// the maximum count.
    fn evict(&self) {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .trainings
            .iter()
            .filter_map(|t| t.finished_at.map(|at| (at, t.key().clone())))
            .collect();
        finished.sort();

        let expired = finished
            .iter()
            .take_while(|(at, _)| cutoff.is_some_and(|cutoff| *at < cutoff))
            .count();
        let excess = finished.len().saturating_sub(self.max_finished);

        for (_, uuid) in finished.iter().take(expired.max(excess)) {
            self.trainings.remove(uuid);
            tracing::debug!(training = %uuid, "Training record evicted");
        }
    }

    pub fn get(&self, uuid: &str) -> Option<TrainingRecord> {
        self.trainings.get(uuid).map(|t| t.record.clone())
    }

    /// Every record, oldest first
    pub fn list(&self) -> Vec<TrainingRecord> {
        let mut records: Vec<TrainingRecord> =
            self.trainings.iter().map(|t| t.record.clone()).collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.uuid.cmp(&b.uuid)));
        records
    }

    /// Cancel a training and wait up to `wait` for it to stop. `None` for unknown ids.
    pub async fn cancel(&self, uuid: &str, wait: Duration) -> Option<TrainingRecord> {
        let mut finished = {
            let training = self.trainings.get(uuid)?;
            training.cancel.cancel();
            training.finished.clone()
        };

        if tokio::time::timeout(wait, finished.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::warn!(training = %uuid, "Training did not stop in time");
        }
        self.get(uuid)
    }
}

pub fn train_router(state: Arc<service_v2::State>, path: Option<String>) -> (Vec<RouteDoc>, Router) {
    let wrapper = state.wrapper();
    let train_path =
        path.unwrap_or_else(|| format!("/{API_VERSION}/models/{}/train", wrapper.name()));
    let training_path = format!("{train_path}/{{uuid}}");

    let docs = vec![
        RouteDoc::new(Method::POST, &train_path)
            .with_summary("Retrain model with available data")
            .with_args(wrapper.get_train_args()),
        RouteDoc::new(Method::GET, &train_path).with_summary("List training runs"),
        RouteDoc::new(Method::GET, &training_path).with_summary("Get training status"),
        RouteDoc::new(Method::DELETE, &training_path).with_summary("Cancel a training run"),
    ];

    let router = Router::new()
        .route(&train_path, get(list_handler).post(start_handler))
        .route(&training_path, get(get_handler).delete(cancel_handler))
        .layer(middleware::from_fn(json_error_middleware))
        .with_state(state);

    (docs, router)
}

async fn start_handler(
    State(state): State<Arc<service_v2::State>>,
    request: Request,
) -> Result<Json<TrainingRecord>, HttpError> {
    let wrapper = state.wrapper().clone();
    if !wrapper.capabilities().train {
        return Err(ModelError::MethodNotImplemented {
            model: wrapper.name().to_string(),
            method: crate::model::ModelMethod::Train,
        }
        .into());
    }

    let specs = wrapper.get_train_args();
    let inputs = input::request_inputs(request, &specs).await?;
    let args = parse_args(&specs, inputs)?;

    Ok(Json(state.trainings().start(wrapper, args)))
}

async fn list_handler(State(state): State<Arc<service_v2::State>>) -> Json<Value> {
    Json(json!({ "trainings": state.trainings().list() }))
}

async fn get_handler(
    State(state): State<Arc<service_v2::State>>,
    Path(uuid): Path<String>,
) -> Result<Json<TrainingRecord>, HttpError> {
    state
        .trainings()
        .get(&uuid)
        .map(Json)
        .ok_or_else(|| HttpError::not_found(format!("training '{uuid}' not found")))
}

async fn cancel_handler(
    State(state): State<Arc<service_v2::State>>,
    Path(uuid): Path<String>,
) -> Result<Json<TrainingRecord>, HttpError> {
    let wait = state.wrapper().options().cancel_grace + KILL_MARGIN;
    state
        .trainings()
        .cancel(&uuid, wait)
        .await
        .map(Json)
        .ok_or_else(|| HttpError::not_found(format!("training '{uuid}' not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::RequestArg;
    use crate::model::{Cancelled, Model};
    use crate::wrapper::{Isolation, WrapperOptions};
    use modelserve_runtime::Runtime;

    async fn wrapper(model: Model) -> (Runtime, Arc<ModelWrapper>) {
        wrapper_with_workers(model, 1).await
    }

    async fn wrapper_with_workers(model: Model, workers: usize) -> (Runtime, Arc<ModelWrapper>) {
        let runtime = Runtime::from_current().unwrap();
        let options = WrapperOptions::builder()
            .isolation(Isolation::Thread)
            .workers(workers)
            .cancel_grace(Duration::from_millis(200))
            .build()
            .unwrap();
        let wrapper = ModelWrapper::new("trainer", model, &runtime, options)
            .await
            .unwrap();
        (runtime, Arc::new(wrapper))
    }

    async fn wait_until_done(history: &TrainingHistory, uuid: &str) -> TrainingRecord {
        for _ in 0..200 {
            let record = history.get(uuid).unwrap();
            if record.status != TrainingStatus::Running {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("training {uuid} did not finish");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_training_completes_with_result() {
        let (runtime, wrapper) =
            wrapper(Model::builder().train(|_, _| Ok(json!({"loss": 0.1}))).build()).await;
        let history = Arc::new(TrainingHistory::new());

        let started = history.start(wrapper, RequestArgs::new());
        assert_eq!(started.status, TrainingStatus::Running);
        assert_eq!(started.uuid.len(), 32);

        let done = wait_until_done(&history, &started.uuid).await;
        assert_eq!(done.status, TrainingStatus::Completed);
        assert_eq!(done.result, Some(json!({"loss": 0.1})));
        assert_eq!(history.list().len(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_training_is_an_error_record() {
        let (runtime, wrapper) =
            wrapper(Model::builder().train(|_, _| anyhow::bail!("no data")).build()).await;
        let history = Arc::new(TrainingHistory::new());

        let started = history.start(wrapper, RequestArgs::new());
        let done = wait_until_done(&history, &started.uuid).await;
        assert_eq!(done.status, TrainingStatus::Error);
        let message = done.message.unwrap();
        assert!(message.contains("error reference"));
        assert!(!message.contains("no data"));
        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finished_trainings_are_evicted() {
        let (runtime, wrapper) = wrapper_with_workers(
            Model::builder()
                .train(|args, _| {
                    let sleep_ms = args.get_as::<u64>("sleep_ms")?.unwrap_or(0);
                    std::thread::sleep(Duration::from_millis(sleep_ms));
                    Ok(Value::Null)
                })
                .train_args(|| Ok([("sleep_ms".to_string(), crate::schema::Field::integer())].into()))
                .build(),
            2,
        )
        .await;
        let history = Arc::new(TrainingHistory::with_retention(Duration::from_secs(3600), 1));
        let train_args = |sleep_ms: u64| {
            let mut args = RequestArgs::new();
            args.insert("sleep_ms".to_string(), RequestArg::Value(json!(sleep_ms)));
            args
        };

        let first = history.start(wrapper.clone(), train_args(0));
        wait_until_done(&history, &first.uuid).await;

        let slow = history.start(wrapper.clone(), train_args(300));
        let second = history.start(wrapper, train_args(0));
        wait_until_done(&history, &second.uuid).await;

        // the oldest finished record goes, the running one stays
        for _ in 0..100 {
            if history.get(&first.uuid).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(history.get(&first.uuid).is_none());
        assert_eq!(history.get(&slow.uuid).unwrap().status, TrainingStatus::Running);
        assert_eq!(history.list().len(), 2);

        wait_until_done(&history, &slow.uuid).await;
        for _ in 0..100 {
            if history.list().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining: Vec<String> = history.list().into_iter().map(|r| r.uuid).collect();
        assert_eq!(remaining, vec![slow.uuid]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_trainings_are_evicted() {
        let history = TrainingHistory::with_retention(Duration::ZERO, 10);
        let (_tx, finished) = watch::channel(true);
        let past = Utc::now() - chrono::Duration::seconds(5);
        for (uuid, finished_at) in [("old", Some(past)), ("running", None)] {
            history.trainings.insert(
                uuid.to_string(),
                Training {
                    record: TrainingRecord {
                        uuid: uuid.to_string(),
                        date: past,
                        status: TrainingStatus::Completed,
                        message: None,
                        result: None,
                    },
                    cancel: CancellationToken::new(),
                    finished: finished.clone(),
                    finished_at,
                },
            );
        }

        history.evict();
        assert!(history.get("old").is_none());
        assert!(history.get("running").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_running_training() {
        let (runtime, wrapper) = wrapper(
            Model::builder()
                .train(|_, cancel| {
                    while !cancel.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(Cancelled.into())
                })
                .build(),
        )
        .await;
        let history = Arc::new(TrainingHistory::new());

        let started = history.start(wrapper, RequestArgs::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = history
            .cancel(&started.uuid, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(record.status, TrainingStatus::Cancelled);
        assert!(history.cancel("unknown", Duration::ZERO).await.is_none());
        runtime.shutdown().await;
    }
}
