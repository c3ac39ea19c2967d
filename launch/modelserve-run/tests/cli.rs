// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;

const BIN: &str = env!("CARGO_BIN_EXE_modelserve");

async fn get_random_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_models_lists_builtin() {
    let output = Command::new(BIN)
        .arg("models")
        .env_remove("MODELSERVE_CONFIG")
        .output()
        .unwrap();
    assert!(output.status.success());

    let listing: Value = serde_json::from_slice(&output.stdout).unwrap();
    let models = listing["models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["name"], "modelserve-test");
    assert_eq!(models[0]["metadata"]["version"], "0.0.1");
    assert_eq!(listing["default"], "modelserve-test");
}

#[test]
fn test_predict_command() {
    let mut input = tempfile::NamedTempFile::new().unwrap();
    write!(input, "some data").unwrap();

    let output = Command::new(BIN)
        .args(["predict", "--arg", "parameter=1", "--file"])
        .arg(format!("data={}", input.path().display()))
        .env_remove("MODELSERVE_MODEL")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let prediction: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(prediction["date"], "2019-01-01");
}

#[test]
fn test_predict_command_rejects_bad_input() {
    let output = Command::new(BIN)
        .args(["predict", "--arg", "parameter=not-a-number"])
        .env_remove("MODELSERVE_MODEL")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

fn modelserve(args: &[&str]) -> std::process::Output {
    Command::new(BIN)
        .args(args)
        .env_remove("MODELSERVE_CONFIG")
        .env_remove("MODELSERVE_MODEL")
        .output()
        .unwrap()
}

#[test]
fn test_metadata_command() {
    let output = modelserve(&["metadata"]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let metadata: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(metadata["name"], "modelserve-test");
    assert_eq!(metadata["version"], "0.0.1");
}

#[test]
fn test_warm_command() {
    let output = modelserve(&["warm", "--model", "modelserve-test"]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(!modelserve(&["warm", "--model", "missing"]).status.success());
}

#[test]
fn test_train_command() {
    let output = modelserve(&["train", "--arg", "parameter_one=3", "--arg", "parameter_two=x"]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let trained: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(trained, serde_json::json!({"result": null}));

    // parameter_one is required
    let output = modelserve(&["train", "--arg", "parameter_two=x"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("parameter_one"));
}

#[test]
fn test_unknown_model_fails_startup() {
    let output = Command::new(BIN)
        .args(["serve", "--model", "missing", "--port", "1"])
        .env_remove("MODELSERVE_CONFIG")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_serve_with_process_workers() {
    let port = get_random_port().await;
    let mut child = Command::new(BIN)
        .args(["serve", "--isolation", "process", "--workers", "2"])
        .args(["--port", &port.to_string()])
        .env_remove("MODELSERVE_CONFIG")
        .env_remove("MODELSERVE_MODEL")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    let base = format!("http://127.0.0.1:{port}");
    let mut ready = false;
    for _ in 0..300 {
        if reqwest::get(format!("{base}/v2")).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let outcome = async move {
        assert!(ready, "service did not start");

        let form = reqwest::multipart::Form::new()
            .part(
                "data",
                reqwest::multipart::Part::bytes(b"abc".to_vec()).file_name("data.txt"),
            )
            .text("parameter", "5");
        let response = reqwest::Client::new()
            .post(format!("{base}/v2/models/modelserve-test/predict"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["labels"][0]["probability"], 1.0);
    };
    // kill the service even when an assertion fails
    let result = tokio::spawn(outcome).await;
    let _ = child.kill();
    let _ = child.wait();
    if let Err(err) = result {
        std::panic::resume_unwind(err.into_panic());
    }
}
