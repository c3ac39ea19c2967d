// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use modelserve_model::{
    Cancelled, Field, FileField, Isolation, Model, ModelError, ModelWrapper, NotImplemented,
    Output, PredictResponse, RequestArg, RequestArgs, SchemaSpec, WrapperOptions, WrapperState,
};
use modelserve_runtime::{CancellationToken, Runtime};
use serde_json::json;

fn thread_options() -> WrapperOptions {
    WrapperOptions::builder()
        .isolation(Isolation::Thread)
        .cancel_grace(Duration::from_millis(500))
        .build()
        .unwrap()
}

async fn load(model: Model) -> (Runtime, ModelWrapper) {
    load_with(model, thread_options()).await
}

async fn load_with(model: Model, options: WrapperOptions) -> (Runtime, ModelWrapper) {
    let runtime = Runtime::from_current().unwrap();
    let wrapper = ModelWrapper::new("demo", model, &runtime, options)
        .await
        .unwrap();
    (runtime, wrapper)
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
    token
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_placeholder_when_missing() {
    let (runtime, wrapper) = load(Model::builder().build()).await;

    let metadata = wrapper.get_metadata();
    assert_eq!(metadata["id"], "0");
    assert_eq!(metadata["name"], "demo");
    assert!(metadata["description"]
        .as_str()
        .unwrap()
        .contains("Could not load description"));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_placeholder_when_handler_fails() {
    let (runtime, wrapper) = load(
        Model::builder()
            .metadata(|| Err(NotImplemented.into()))
            .build(),
    )
    .await;
    assert_eq!(wrapper.get_metadata()["name"], "demo");
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_placeholder_is_stable() {
    let (runtime, wrapper) = load(
        Model::builder()
            .metadata(|| Ok(json!("just a string")))
            .build(),
    )
    .await;

    let first = wrapper.get_metadata();
    assert!(first.is_object());
    assert_eq!(first["id"], "0");
    assert_eq!(first["name"], "demo");
    assert_eq!(wrapper.get_metadata(), first);

    let (runtime2, wrapper2) = load(Model::builder().build()).await;
    assert_eq!(wrapper2.get_metadata(), wrapper2.get_metadata());
    assert_eq!(wrapper2.get_metadata(), first);

    runtime.shutdown().await;
    runtime2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_arg_specs_empty_when_unavailable() {
    let models = [
        Model::builder().build(),
        Model::builder()
            .predict_args(|| Err(NotImplemented.into()))
            .train_args(|| Err(NotImplemented.into()))
            .build(),
        Model::builder()
            .predict_args(|| anyhow::bail!("broken declarations"))
            .train_args(|| anyhow::bail!("broken declarations"))
            .build(),
    ];

    for model in models {
        let (runtime, wrapper) = load(model).await;
        assert!(wrapper.get_predict_args().is_empty());
        assert!(wrapper.get_train_args().is_empty());
        runtime.shutdown().await;
    }

    let (runtime, wrapper) = load(
        Model::builder()
            .train_args(|| Ok([("epochs".to_string(), Field::integer())].into()))
            .build(),
    )
    .await;
    assert!(wrapper.get_predict_args().is_empty());
    assert!(wrapper.get_train_args().contains_key("epochs"));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_predict_not_implemented() {
    let (runtime, wrapper) = load(Model::builder().build()).await;

    let err = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::MethodNotImplemented { .. }));
    assert!(err.is_client_error());

    // a handler that declines at runtime is treated the same way
    let (runtime2, wrapper2) = load(
        Model::builder()
            .predict(|_, _| Err(NotImplemented.into()))
            .build(),
    )
    .await;
    let err = wrapper2
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::MethodNotImplemented { .. }));

    runtime.shutdown().await;
    runtime2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_predict_without_schema_is_wrapped() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|_, _| Ok(json!({"label": "foo", "probability": 1.0}).into()))
            .build(),
    )
    .await;

    let response = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        response,
        PredictResponse::Json(json!({
            "status": "OK",
            "predictions": {"label": "foo", "probability": 1.0},
        }))
    );
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_predict_validated_against_schema() {
    let schema = SchemaSpec::Fields(
        [("label".to_string(), Field::string().required())]
            .into_iter()
            .collect(),
    );
    let (runtime, wrapper) = load(
        Model::builder()
            .schema(schema)
            .predict(|args, _| {
                if args.value("valid") == Some(&json!(true)) {
                    Ok(json!({"label": "cat"}).into())
                } else {
                    Ok(json!({"label": 7}).into())
                }
            })
            .build(),
    )
    .await;

    let mut args = RequestArgs::new();
    args.insert("valid".into(), RequestArg::Value(json!(true)));
    let response = wrapper
        .predict(args, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response, PredictResponse::Json(json!({"label": "cat"})));

    let err = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ResponseValidation { .. }));
    assert_eq!(
        err.to_string(),
        "ERROR validating model response, check server logs"
    );
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_validate_response_without_schema() {
    let (runtime, wrapper) = load(Model::builder().build()).await;
    assert_eq!(
        wrapper.validate_response(&json!({})),
        Err(ModelError::MissingModelSchema {
            model: "demo".into()
        })
    );
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uploads_removed_after_call() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|args, _| {
                let upload = args.file("data").expect("upload staged");
                let content = upload.read()?;
                Ok(json!({
                    "path": upload.filename,
                    "content": String::from_utf8(content)?,
                    "original": upload.original_filename,
                    "content_type": upload.content_type,
                })
                .into())
            })
            .build(),
    )
    .await;

    let mut args = RequestArgs::new();
    args.insert(
        "data".into(),
        RequestArg::File(FileField::from_bytes(
            "data",
            Some("input.txt".into()),
            Some("text/plain".into()),
            b"hello".to_vec(),
        )),
    );

    let PredictResponse::Json(value) = wrapper
        .predict(args, &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected JSON");
    };
    let predictions = &value["predictions"];
    assert_eq!(predictions["content"], "hello");
    assert_eq!(predictions["original"], "input.txt");
    assert_eq!(predictions["content_type"], "text/plain");

    let path = PathBuf::from(predictions["path"].as_str().unwrap());
    assert!(!path.exists());
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_predict_returns_file() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|_, _| {
                Ok(Output::Bytes {
                    data: b"png-bytes".to_vec(),
                    content_type: Some("image/png".into()),
                })
            })
            .build(),
    )
    .await;

    let PredictResponse::File(file) = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected a file");
    };
    assert_eq!(file.content_type.as_deref(), Some("image/png"));
    let path = file.filename.clone();
    assert_eq!(file.take().await.unwrap(), b"png-bytes");
    assert!(!path.exists());
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_in_flight_prediction() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|_, cancel| {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(Cancelled.into())
            })
            .build(),
    )
    .await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = wrapper
        .predict(RequestArgs::new(), &token)
        .await
        .unwrap_err();
    assert_eq!(err, ModelError::Cancelled);

    // the worker slot is usable again
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(wrapper.available_workers(), 1);
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_file_result_is_removed() {
    let marker = format!("abandoned-result-{}", uuid::Uuid::new_v4());
    let content = marker.clone().into_bytes();
    let options = WrapperOptions::builder()
        .isolation(Isolation::Thread)
        .cancel_grace(Duration::from_millis(50))
        .build()
        .unwrap();
    let (runtime, wrapper) = load_with(
        Model::builder()
            .predict(move |_, _| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(Output::Bytes {
                    data: content.clone(),
                    content_type: None,
                })
            })
            .build(),
        options,
    )
    .await;

    let err = wrapper
        .predict(RequestArgs::new(), &cancel_after(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err, ModelError::Cancelled);

    // the abandoned job finishes in the background and writes its result
    tokio::time::sleep(Duration::from_secs(1)).await;

    let leftovers: Vec<PathBuf> = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("modelserve-result-"))
        })
        .filter(|path| std::fs::read(path).is_ok_and(|data| data == marker.as_bytes()))
        .collect();
    assert!(leftovers.is_empty(), "result files left behind: {leftovers:?}");
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_train_not_implemented() {
    let (runtime, wrapper) = load(Model::builder().build()).await;

    let err = wrapper
        .train(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::MethodNotImplemented { .. }));
    assert!(err.is_client_error());
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_training_that_ignores_the_token() {
    let (runtime, wrapper) = load(
        Model::builder()
            .train(|_, _| {
                std::thread::sleep(Duration::from_secs(2));
                Ok(json!("finished"))
            })
            .predict(|_, _| Ok(Output::Json(json!("ok"))))
            .build(),
    )
    .await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = wrapper
        .train(RequestArgs::new(), &token)
        .await
        .unwrap_err();
    assert_eq!(err, ModelError::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(1500));

    let response = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        response,
        PredictResponse::Json(json!({"status": "OK", "predictions": "ok"}))
    );
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unexpected_error_hides_details() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|_, _| anyhow::bail!("database password is hunter2"))
            .build(),
    )
    .await;

    let err = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::MethodUnexpected { .. }));
    assert!(!err.to_string().contains("hunter2"));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_model_is_unexpected_error() {
    let (runtime, wrapper) = load(
        Model::builder()
            .predict(|_, _| panic!("model bug"))
            .build(),
    )
    .await;

    let err = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::MethodUnexpected { .. }));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_warm_without_warm_step() {
    let (runtime, wrapper) = load(Model::builder().build()).await;
    assert_eq!(wrapper.warm().await, Ok(()));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_warm_step_is_an_error() {
    let (runtime, wrapper) = load(
        Model::builder()
            .warm(|| anyhow::bail!("weights missing"))
            .predict(|_, _| Ok(Output::Json(json!("ok"))))
            .build(),
    )
    .await;

    let err = wrapper.warm().await.unwrap_err();
    assert!(matches!(err, ModelError::MethodUnexpected { .. }));
    assert!(!err.to_string().contains("weights missing"));

    // the worker survives a failed warm step
    assert!(wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .is_ok());
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_warm_declined_at_runtime() {
    let (runtime, wrapper) = load(
        Model::builder()
            .warm(|| Err(NotImplemented.into()))
            .build(),
    )
    .await;
    assert_eq!(wrapper.warm().await, Ok(()));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_is_idempotent() {
    let (runtime, wrapper) = load(modelserve_model::test_model::build()).await;
    assert_eq!(wrapper.state(), WrapperState::Ready);

    wrapper.shutdown().await;
    wrapper.shutdown().await;
    assert_eq!(wrapper.state(), WrapperState::ShutDown);

    let err = wrapper
        .predict(RequestArgs::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ShutDown { .. }));
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_schema_fails_construction() {
    let runtime = Runtime::from_current().unwrap();
    let model = Model::builder()
        .schema(SchemaSpec::Declared(json!({"date": "not-a-field"})))
        .build();

    let err = ModelWrapper::new("broken", model, &runtime, thread_options())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::InvalidSchema { .. })
    ));
    runtime.shutdown().await;
}
