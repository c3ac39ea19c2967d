// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model calls as pool jobs.
//!
//! [`ModelJob`] and [`JobResult`] are plain data so they can cross a process boundary.
//! [`ModelJobHandler`] runs them against a [`Model`] on a worker, converting every
//! failure, panics included, into a [`JobFault`] before it leaves the worker.

use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use modelserve_runtime::pool::JobHandler;

use crate::args::Args;
use crate::files::ReturnedFile;
use crate::model::{catch_panic, Cancelled, Model, ModelMethod, NotImplemented, Output};

const RESULT_PREFIX: &str = "modelserve-result-";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ModelJob {
    Predict { args: Args },
    Train { args: Args },
    Warm,
}

impl ModelJob {
    pub fn method(&self) -> ModelMethod {
        match self {
            ModelJob::Predict { .. } => ModelMethod::Predict,
            ModelJob::Train { .. } => ModelMethod::Train,
            ModelJob::Warm => ModelMethod::Warm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Json { value: Value },
    File { file: ReturnedFile },
    Done,
}

/// A job that did not produce output. Details of `Failed` stay in the worker's log,
/// under `reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum JobFault {
    #[error("not implemented by the model")]
    NotImplemented,

    #[error("cancelled")]
    Cancelled,

    #[error("model call failed (error reference {reference})")]
    Failed { reference: String },
}

pub type JobResult = Result<JobOutput, JobFault>;

/// Runs [`ModelJob`]s on a pool worker
pub struct ModelJobHandler {
    name: String,
    model: Arc<Model>,
}

impl ModelJobHandler {
    pub fn new(name: impl Into<String>, model: Arc<Model>) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }

    fn run(&self, job: ModelJob, cancel: &CancellationToken) -> anyhow::Result<JobOutput> {
        match job {
            ModelJob::Predict { args } => {
                let predict = self.model.predict.as_ref().ok_or(NotImplemented)?;
                into_job_output(predict(args, cancel)?)
            }
            ModelJob::Train { args } => {
                let train = self.model.train.as_ref().ok_or(NotImplemented)?;
                let value = train(args, cancel)?;
                Ok(JobOutput::Json { value })
            }
            ModelJob::Warm => {
                let warm = self.model.warm.as_ref().ok_or(NotImplemented)?;
                warm()?;
                Ok(JobOutput::Done)
            }
        }
    }

    fn fault(&self, method: ModelMethod, err: anyhow::Error) -> JobFault {
        if err.is::<NotImplemented>() {
            return JobFault::NotImplemented;
        }
        if err.is::<Cancelled>() {
            return JobFault::Cancelled;
        }

        let reference = uuid::Uuid::new_v4().to_string();
        tracing::error!(
            model = %self.name,
            %method,
            %reference,
            error = format!("{err:?}"),
            "An error happened when calling a method on the model"
        );
        JobFault::Failed { reference }
    }
}

impl JobHandler for ModelJobHandler {
    type Request = ModelJob;
    type Response = JobResult;

    fn handle(&mut self, job: ModelJob, cancel: &CancellationToken) -> JobResult {
        let method = job.method();
        tracing::debug!(model = %self.name, %method, "Running model job");
        catch_panic(|| self.run(job, cancel)).map_err(|err| self.fault(method, err))
    }

    fn discard(response: JobResult) {
        discard_result(response);
    }
}

/// Remove the file behind a result that nobody will read.
pub fn discard_result(result: JobResult) {
    if let Ok(JobOutput::File { file }) = result {
        tracing::debug!(path = %file.filename.display(), "Removing result of an abandoned job");
        file.discard();
    }
}

fn into_job_output(output: Output) -> anyhow::Result<JobOutput> {
    match output {
        Output::Json(value) => Ok(JobOutput::Json { value }),
        Output::Bytes { data, content_type } => {
            let mut file = tempfile::Builder::new().prefix(RESULT_PREFIX).tempfile()?;
            file.write_all(&data)?;
            file.flush()?;
            let filename = file.into_temp_path().keep()?;
            Ok(JobOutput::File {
                file: ReturnedFile {
                    name: "result".to_string(),
                    filename,
                    content_type,
                    original_filename: None,
                },
            })
        }
        Output::File {
            path,
            content_type,
            original_filename,
        } => Ok(JobOutput::File {
            file: ReturnedFile {
                name: "result".to_string(),
                filename: path,
                content_type,
                original_filename,
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(model: Model) -> ModelJobHandler {
        ModelJobHandler::new("demo", Arc::new(model))
    }

    #[test]
    fn test_missing_handlers_are_not_implemented() {
        let mut handler = handler(Model::builder().build());
        let cancel = CancellationToken::new();
        for job in [
            ModelJob::Predict { args: Args::new() },
            ModelJob::Train { args: Args::new() },
            ModelJob::Warm,
        ] {
            assert_eq!(handler.handle(job, &cancel), Err(JobFault::NotImplemented));
        }
    }

    #[test]
    fn test_errors_and_panics_become_faults() {
        let mut handler = handler(
            Model::builder()
                .predict(|_, _| anyhow::bail!("disk on fire"))
                .train(|_, _| panic!("train exploded"))
                .warm(|| Err(NotImplemented.into()))
                .build(),
        );
        let cancel = CancellationToken::new();

        let fault = handler
            .handle(ModelJob::Predict { args: Args::new() }, &cancel)
            .unwrap_err();
        assert!(matches!(fault, JobFault::Failed { .. }));
        assert!(!fault.to_string().contains("disk on fire"));

        let fault = handler
            .handle(ModelJob::Train { args: Args::new() }, &cancel)
            .unwrap_err();
        assert!(matches!(fault, JobFault::Failed { .. }));

        assert_eq!(
            handler.handle(ModelJob::Warm, &cancel),
            Err(JobFault::NotImplemented)
        );
    }

    #[test]
    fn test_cancelled_marker() {
        let mut handler = handler(
            Model::builder()
                .train(|_, cancel| {
                    if cancel.is_cancelled() {
                        return Err(Cancelled.into());
                    }
                    Ok(json!("done"))
                })
                .build(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            handler.handle(ModelJob::Train { args: Args::new() }, &cancel),
            Err(JobFault::Cancelled)
        );
    }

    #[test]
    fn test_bytes_output_becomes_returned_file() {
        let mut handler = handler(
            Model::builder()
                .predict(|_, _| {
                    Ok(Output::Bytes {
                        data: b"PNG".to_vec(),
                        content_type: Some("image/png".into()),
                    })
                })
                .build(),
        );
        let result = handler
            .handle(
                ModelJob::Predict { args: Args::new() },
                &CancellationToken::new(),
            )
            .unwrap();

        let JobOutput::File { file } = result else {
            panic!("expected a file, got {result:?}");
        };
        assert_eq!(file.content_type.as_deref(), Some("image/png"));
        assert_eq!(std::fs::read(&file.filename).unwrap(), b"PNG");
        std::fs::remove_file(&file.filename).unwrap();
    }

    #[test]
    fn test_job_wire_format() {
        let job = ModelJob::Predict {
            args: [("n".to_string(), crate::args::Arg::Value(json!(1)))]
                .into_iter()
                .collect(),
        };
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({"op": "predict", "args": {"n": {"kind": "value", "value": 1}}})
        );

        let result: JobResult = Err(JobFault::Failed {
            reference: "abc".into(),
        });
        let wire = serde_json::to_string(&result).unwrap();
        let back: JobResult = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, result);
    }
}
