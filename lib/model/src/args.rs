// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Arguments on their way from a request to a model call.
//!
//! [`parse_args`] turns raw request inputs into [`RequestArgs`] following the model's
//! declared [`ArgSpecs`]. The wrapper then stages any file uploads and hands the model
//! plain [`Args`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use modelserve_runtime::config::parse_bool;

use crate::errors::ModelError;
use crate::files::{FileField, UploadedFile};
use crate::schema::{check_value, ArgSpecs, Field, FieldKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Value(Value),
    File(UploadedFile),
}

/// Arguments as seen by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(BTreeMap<String, Arg>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, arg: Arg) -> Option<Arg> {
        self.0.insert(name.into(), arg)
    }

    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.0.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.0.get(name) {
            Some(Arg::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        match self.0.get(name) {
            Some(Arg::File(file)) => Some(file),
            _ => None,
        }
    }

    /// Deserialize a value argument, `None` when absent
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.value(name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|err| anyhow::anyhow!("argument '{name}': {err}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arg)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Arg)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Arg)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An argument before upload staging
#[derive(Debug)]
pub enum RequestArg {
    Value(Value),
    File(FileField),
}

pub type RequestArgs = BTreeMap<String, RequestArg>;

/// One raw input as found in the request
#[derive(Debug)]
pub enum RawInput {
    /// Query string or urlencoded form value
    Text(String),
    /// Member of a JSON body
    Json(Value),
    File(FileField),
}

/// Validate and coerce raw inputs against the declared arguments.
///
/// Repeated inputs feed list arguments; for scalars the last one wins. Declared defaults
/// fill in missing arguments, JSON `null` counts as missing and undeclared inputs are
/// dropped.
pub fn parse_args(
    specs: &ArgSpecs,
    inputs: impl IntoIterator<Item = (String, RawInput)>,
) -> Result<RequestArgs, ModelError> {
    let mut grouped: BTreeMap<String, Vec<RawInput>> = BTreeMap::new();
    for (name, input) in inputs {
        if matches!(input, RawInput::Json(Value::Null)) {
            // null stands for an absent argument
            continue;
        }
        if specs.contains_key(&name) {
            grouped.entry(name).or_default().push(input);
        } else {
            tracing::debug!(argument = %name, "Dropping undeclared argument");
        }
    }

    let mut args = RequestArgs::new();
    for (name, field) in specs {
        match grouped.remove(name) {
            Some(inputs) => {
                args.insert(name.clone(), coerce(name, field, inputs)?);
            }
            None => match &field.default {
                Some(default) => {
                    args.insert(name.clone(), RequestArg::Value(default.clone()));
                }
                None if field.required => {
                    return Err(ModelError::input(name, "missing required argument"));
                }
                None => {}
            },
        }
    }
    Ok(args)
}

fn coerce(name: &str, field: &Field, mut inputs: Vec<RawInput>) -> Result<RequestArg, ModelError> {
    match &field.kind {
        FieldKind::File => match inputs.pop() {
            Some(RawInput::File(file)) => Ok(RequestArg::File(file)),
            _ => Err(ModelError::input(name, "expected a file upload")),
        },
        FieldKind::List { items } => {
            let element = |input: RawInput| {
                let value = coerce_value(name, items, input)?;
                check_choices(name, items, &value)?;
                Ok::<_, ModelError>(value)
            };
            let mut elements = Vec::new();
            for input in inputs {
                match input {
                    RawInput::Json(Value::Array(values)) => {
                        for value in values {
                            elements.push(element(RawInput::Json(value))?);
                        }
                    }
                    other => elements.push(element(other)?),
                }
            }
            let value = Value::Array(elements);
            check_choices(name, field, &value)?;
            Ok(RequestArg::Value(value))
        }
        _ => {
            let Some(input) = inputs.pop() else {
                return Err(ModelError::input(name, "no value given"));
            };
            let value = coerce_value(name, field, input)?;
            check_choices(name, field, &value)?;
            Ok(RequestArg::Value(value))
        }
    }
}

fn coerce_value(name: &str, field: &Field, input: RawInput) -> Result<Value, ModelError> {
    match input {
        RawInput::File(_) => Err(ModelError::input(
            name,
            format!("expected {}, got a file upload", field.kind.type_name()),
        )),
        RawInput::Json(Value::String(text)) if !matches!(field.kind, FieldKind::String) => {
            coerce_value(name, field, RawInput::Text(text))
        }
        RawInput::Json(value) => {
            let mut problems = Vec::new();
            check_value(field, &value, name, &mut problems);
            if problems.is_empty() {
                Ok(value)
            } else {
                Err(ModelError::input(name, problems.join("; ")))
            }
        }
        RawInput::Text(text) => parse_text(name, field, text),
    }
}

fn parse_text(name: &str, field: &Field, text: String) -> Result<Value, ModelError> {
    let invalid = |reason: String| ModelError::input(name, reason);
    match &field.kind {
        FieldKind::String => Ok(Value::String(text)),
        FieldKind::Integer => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(format!("'{text}' is not a valid integer"))),
        FieldKind::Float => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("'{text}' is not a valid number"))),
        FieldKind::Boolean => parse_bool(text.trim())
            .map(Value::Bool)
            .map_err(|_| invalid(format!("'{text}' is not a valid boolean"))),
        FieldKind::Date | FieldKind::DateTime => {
            let value = Value::String(text);
            let mut problems = Vec::new();
            check_value(field, &value, name, &mut problems);
            if problems.is_empty() {
                Ok(value)
            } else {
                Err(invalid(problems.join("; ")))
            }
        }
        FieldKind::Any => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        FieldKind::Nested { .. } | FieldKind::List { .. } => {
            let value: Value = serde_json::from_str(&text)
                .map_err(|err| invalid(format!("expected JSON: {err}")))?;
            coerce_value(name, field, RawInput::Json(value))
        }
        FieldKind::File => Err(invalid("expected a file upload".to_string())),
    }
}

fn check_choices(name: &str, field: &Field, value: &Value) -> Result<(), ModelError> {
    let Some(choices) = &field.choices else {
        return Ok(());
    };
    let accepted = match value {
        Value::Array(elements) => elements.iter().all(|e| choices.contains(e)),
        other => choices.contains(other),
    };
    if accepted {
        Ok(())
    } else {
        let allowed: Vec<String> = choices.iter().map(Value::to_string).collect();
        Err(ModelError::input(
            name,
            format!("{value} must be one of [{}]", allowed.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn specs() -> ArgSpecs {
        ArgSpecs::from([
            ("count".to_string(), Field::integer().required()),
            ("ratio".to_string(), Field::float().default_value(0.5)),
            ("flag".to_string(), Field::boolean()),
            ("mode".to_string(), Field::string().choices(["foo", "bar"])),
            ("tags".to_string(), Field::list(Field::string())),
            ("data".to_string(), Field::file()),
        ])
    }

    fn text(name: &str, value: &str) -> (String, RawInput) {
        (name.to_string(), RawInput::Text(value.to_string()))
    }

    fn value_of(args: &RequestArgs, name: &str) -> Value {
        match args.get(name) {
            Some(RequestArg::Value(value)) => value.clone(),
            other => panic!("{name} is not a value: {other:?}"),
        }
    }

    #[test]
    fn test_text_inputs_are_coerced() {
        let args = parse_args(
            &specs(),
            vec![
                text("count", "3"),
                text("flag", "true"),
                text("tags", "a"),
                text("tags", "b"),
                text("undeclared", "x"),
            ],
        )
        .unwrap();

        assert_eq!(value_of(&args, "count"), json!(3));
        assert_eq!(value_of(&args, "flag"), json!(true));
        assert_eq!(value_of(&args, "ratio"), json!(0.5));
        assert_eq!(value_of(&args, "tags"), json!(["a", "b"]));
        assert!(!args.contains_key("undeclared"));
        assert!(!args.contains_key("mode"));
    }

    #[test]
    fn test_json_inputs() {
        let args = parse_args(
            &specs(),
            vec![
                ("count".to_string(), RawInput::Json(json!(7))),
                ("ratio".to_string(), RawInput::Json(json!("0.25"))),
                ("tags".to_string(), RawInput::Json(json!(["x", "y"]))),
            ],
        )
        .unwrap();
        assert_eq!(value_of(&args, "count"), json!(7));
        assert_eq!(value_of(&args, "ratio"), json!(0.25));
        assert_eq!(value_of(&args, "tags"), json!(["x", "y"]));
    }

    #[rstest]
    #[case("ratio", Some(json!(0.5)))]
    #[case("flag", None)]
    #[case("mode", None)]
    fn test_null_is_an_absent_argument(#[case] name: &str, #[case] expected: Option<Value>) {
        let args = parse_args(
            &specs(),
            vec![
                ("count".to_string(), RawInput::Json(json!(1))),
                (name.to_string(), RawInput::Json(Value::Null)),
            ],
        )
        .unwrap();
        assert_eq!(args.get(name).map(|_| value_of(&args, name)), expected);
    }

    #[test]
    fn test_null_for_required_argument_is_missing() {
        match parse_args(&specs(), vec![("count".to_string(), RawInput::Json(Value::Null))]) {
            Err(err @ ModelError::InputValidation { .. }) => {
                assert!(err.to_string().contains("missing required argument"))
            }
            other => panic!("expected an input validation error, got {other:?}"),
        }
    }

    #[rstest]
    #[case(vec![], "count")]
    #[case(vec![text("count", "three")], "count")]
    #[case(vec![text("count", "1"), text("mode", "baz")], "mode")]
    #[case(vec![text("count", "1"), text("flag", "maybe")], "flag")]
    #[case(vec![text("count", "1"), text("data", "not-a-file")], "data")]
    fn test_invalid_inputs(#[case] inputs: Vec<(String, RawInput)>, #[case] field: &str) {
        match parse_args(&specs(), inputs) {
            Err(ModelError::InputValidation { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected an input validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_file_input_is_kept_as_field() {
        let upload = FileField::from_bytes("data", Some("a.txt".into()), None, b"abc".to_vec());
        let args = parse_args(
            &specs(),
            vec![text("count", "1"), ("data".to_string(), RawInput::File(upload))],
        )
        .unwrap();
        assert!(matches!(args.get("data"), Some(RequestArg::File(f)) if f.name == "data"));
    }

    #[test]
    fn test_args_accessors() {
        let args: Args = [
            ("n".to_string(), Arg::Value(json!(4))),
            (
                "f".to_string(),
                Arg::File(UploadedFile {
                    name: "f".into(),
                    filename: "/tmp/x".into(),
                    content_type: None,
                    original_filename: None,
                }),
            ),
        ]
        .into_iter()
        .collect();

        assert_eq!(args.get_as::<u32>("n").unwrap(), Some(4));
        assert_eq!(args.get_as::<u32>("missing").unwrap(), None);
        assert!(args.get_as::<String>("n").is_err());
        assert!(args.file("f").is_some());
        assert!(args.value("f").is_none());
        assert_eq!(args.len(), 2);
    }
}
