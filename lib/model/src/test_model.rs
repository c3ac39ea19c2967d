// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A placeholder model implementing the whole contract, served when no other model
//! is registered.

use serde_json::{json, Value};

use crate::model::{Model, Output};
use crate::schema::{ArgSpecs, Field, SchemaSpec};

pub const NAME: &str = "modelserve-test";

pub fn build() -> Model {
    Model::builder()
        .metadata(|| Ok(metadata()))
        .schema(SchemaSpec::Fields(response_schema()))
        .warm(|| {
            tracing::debug!("Test model is warming...");
            Ok(())
        })
        .predict(|args, _cancel| {
            tracing::debug!(?args, "Got the following arguments");
            Ok(Output::Json(json!({
                "date": "2019-01-01",
                "labels": [{"label": "foo", "probability": 1.0}],
            })))
        })
        .train(|args, _cancel| {
            tracing::debug!(?args, "Got the following arguments");
            Ok(Value::Null)
        })
        .predict_args(|| Ok(predict_args()))
        .train_args(|| Ok(train_args()))
        .build()
}

fn metadata() -> Value {
    json!({
        "id": "0",
        "name": NAME,
        "description": "This is not a model at all, just a placeholder for testing the API \
                        functionality. If you are seeing this, it is because no valid model \
                        could be loaded.",
        "author": "modelserve contributors",
        "version": "0.0.1",
        "url": "https://github.com/modelserve/modelserve",
        "license": "Apache 2.0",
    })
}

fn response_schema() -> ArgSpecs {
    ArgSpecs::from([
        ("date".to_string(), Field::date()),
        (
            "labels".to_string(),
            Field::list(Field::nested([
                ("label", Field::string()),
                ("probability", Field::float()),
            ])),
        ),
    ])
}

fn predict_args() -> ArgSpecs {
    ArgSpecs::from([
        (
            "data".to_string(),
            Field::file()
                .required()
                .description("Data file to perform inference."),
        ),
        (
            "parameter".to_string(),
            Field::integer()
                .required()
                .description("This is a parameter for prediction"),
        ),
        (
            "parameter_three".to_string(),
            Field::string()
                .description(
                    "This is a parameter that forces its value to be one of the choices \
                     declared in 'enum'",
                )
                .choices(["foo", "bar"]),
        ),
    ])
}

fn train_args() -> ArgSpecs {
    ArgSpecs::from([
        (
            "parameter_one".to_string(),
            Field::integer()
                .required()
                .description("This is a integer parameter, and it is a required one."),
        ),
        (
            "parameter_two".to_string(),
            Field::string().description("This is a string parameter."),
        ),
    ])
}
