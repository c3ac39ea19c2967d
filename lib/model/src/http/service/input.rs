// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collect raw arguments from a request: the query string, then the body as
//! urlencoded form, multipart form or JSON object.

use axum::{
    extract::{FromRequest, Multipart, Query, Request},
    http::header,
    Form, Json,
};
use serde_json::Value;

use crate::args::RawInput;
use crate::errors::ModelError;
use crate::files::FileField;
use crate::schema::ArgSpecs;

type Inputs = Vec<(String, RawInput)>;

pub(crate) async fn request_inputs(request: Request, specs: &ArgSpecs) -> Result<Inputs, ModelError> {
    let mut inputs: Inputs = Vec::new();

    let Query(query) = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map_err(|err| ModelError::input("query", err.body_text()))?;
    inputs.extend(query.into_iter().map(|(k, v)| (k, RawInput::Text(v))));

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        inputs.extend(multipart_inputs(request, specs).await?);
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = Form::<Vec<(String, String)>>::from_request(request, &())
            .await
            .map_err(|err| ModelError::input("body", err.body_text()))?;
        inputs.extend(form.into_iter().map(|(k, v)| (k, RawInput::Text(v))));
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<Value>::from_request(request, &())
            .await
            .map_err(|err| ModelError::input("body", err.body_text()))?;
        match body {
            Value::Object(members) => {
                inputs.extend(members.into_iter().map(|(k, v)| (k, RawInput::Json(v))));
            }
            Value::Null => {}
            _ => return Err(ModelError::input("body", "expected a JSON object")),
        }
    }

    Ok(inputs)
}

async fn multipart_inputs(request: Request, specs: &ArgSpecs) -> Result<Inputs, ModelError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| ModelError::input("body", err.body_text()))?;

    let mut inputs = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ModelError::input("body", err.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let declared_file = specs.get(&name).map(|f| f.is_file()).unwrap_or(false);
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);

        let data = field
            .bytes()
            .await
            .map_err(|err| ModelError::input(&name, err.body_text()))?;

        let input = if declared_file || filename.is_some() {
            RawInput::File(FileField::from_bytes(&name, filename, content_type, data.to_vec()))
        } else {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| ModelError::input(&name, "form value is not valid UTF-8"))?;
            RawInput::Text(text)
        };
        inputs.push((name, input));
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use axum::body::Body;

    fn specs() -> ArgSpecs {
        ArgSpecs::from([
            ("n".to_string(), Field::integer()),
            ("data".to_string(), Field::file()),
        ])
    }

    fn text_of(input: &RawInput) -> &str {
        match input {
            RawInput::Text(text) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_and_form() {
        let request = Request::builder()
            .method("POST")
            .uri("/predict?n=1&tag=a")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("n=2"))
            .unwrap();

        let inputs = request_inputs(request, &specs()).await.unwrap();
        let pairs: Vec<(&str, &str)> = inputs
            .iter()
            .map(|(k, v)| (k.as_str(), text_of(v)))
            .collect();
        assert_eq!(pairs, [("n", "1"), ("tag", "a"), ("n", "2")]);
    }

    #[tokio::test]
    async fn test_json_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"n": 3}"#))
            .unwrap();
        let inputs = request_inputs(request, &specs()).await.unwrap();
        assert!(matches!(&inputs[..], [(name, RawInput::Json(Value::Number(_)))] if name == "n"));

        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("[1, 2]"))
            .unwrap();
        assert!(matches!(
            request_inputs(request, &specs()).await,
            Err(ModelError::InputValidation { .. })
        ));
    }

    #[tokio::test]
    async fn test_multipart_file_and_text() {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"n\"\r\n\r\n\
             7\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"data\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let inputs = request_inputs(request, &specs()).await.unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(text_of(&inputs[0].1), "7");
        match &inputs[1].1 {
            RawInput::File(file) => {
                assert_eq!(file.filename.as_deref(), Some("a.txt"));
                assert_eq!(file.content_type.as_deref(), Some("text/plain"));
            }
            other => panic!("expected a file, got {other:?}"),
        }
    }
}
