// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Field descriptors and response schema validation.
//!
//! The same [`Field`] type declares model arguments and describes responses. A model's
//! response schema comes in one of three shapes ([`SchemaSpec`]) and is normalised once,
//! when the wrapper is built, into a [`ResponseValidator`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Argument declarations, by argument name
pub type ArgSpecs = BTreeMap<String, Field>;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    File,
    Any,
    #[serde(alias = "array")]
    List { items: Box<Field> },
    #[serde(alias = "object")]
    Nested { fields: BTreeMap<String, Field> },
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::DateTime => "datetime",
            FieldKind::File => "file",
            FieldKind::Any => "any",
            FieldKind::List { .. } => "list",
            FieldKind::Nested { .. } => "nested",
        }
    }
}

/// Where an argument is expected in the HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Query,
    Form,
    Json,
    Files,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(
        default,
        rename = "enum",
        alias = "choices",
        skip_serializing_if = "Option::is_none"
    )]
    pub choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Field {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            description: None,
            default: None,
            choices: None,
            location: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    pub fn datetime() -> Self {
        Self::new(FieldKind::DateTime)
    }

    /// A file upload, sent as multipart form data
    pub fn file() -> Self {
        Self::new(FieldKind::File).location(Location::Form)
    }

    pub fn any() -> Self {
        Self::new(FieldKind::Any)
    }

    pub fn list(items: Field) -> Self {
        Self::new(FieldKind::List {
            items: Box::new(items),
        })
    }

    pub fn nested<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Field)>,
        K: Into<String>,
    {
        Self::new(FieldKind::Nested {
            fields: fields.into_iter().map(|(k, f)| (k.into(), f)).collect(),
        })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, FieldKind::File)
    }

    /// Parse a declaration such as `{"type": "list", "items": {"type": "int"}}`.
    /// A bare string is shorthand for `{"type": <string>}`.
    pub fn from_declaration(declaration: &Value) -> Result<Field, String> {
        let parsed = match declaration {
            Value::String(kind) => serde_json::from_value(serde_json::json!({ "type": kind })),
            Value::Object(_) => serde_json::from_value(declaration.clone()),
            other => return Err(format!("expected a field declaration, found {other}")),
        };
        parsed.map_err(|err| err.to_string())
    }

    /// Problems found checking `value` against this field, empty when it conforms
    pub fn check(&self, value: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        check_value(self, value, "$", &mut problems);
        problems
    }
}

/// A custom response validator supplied by the model.
pub trait ResponseSchema: Send + Sync + fmt::Debug {
    /// `Err` carries one message per problem found
    fn validate(&self, payload: &Value) -> Result<(), Vec<String>>;
}

/// How a model declares its response schema.
#[derive(Debug, Clone)]
pub enum SchemaSpec {
    Fields(ArgSpecs),
    Schema(Arc<dyn ResponseSchema>),
    /// An untyped declaration: a JSON object of `name -> field declaration`
    Declared(Value),
}

/// Normalised response schema
#[derive(Debug, Clone)]
pub enum ResponseValidator {
    Fields(ArgSpecs),
    Custom(Arc<dyn ResponseSchema>),
}

impl ResponseValidator {
    pub fn from_spec(spec: SchemaSpec) -> Result<Self, String> {
        match spec {
            SchemaSpec::Fields(fields) => Ok(ResponseValidator::Fields(fields)),
            SchemaSpec::Schema(schema) => Ok(ResponseValidator::Custom(schema)),
            SchemaSpec::Declared(Value::Object(map)) => map
                .iter()
                .map(|(name, declaration)| {
                    Field::from_declaration(declaration)
                        .map(|field| (name.clone(), field))
                        .map_err(|err| format!("field '{name}': {err}"))
                })
                .collect::<Result<ArgSpecs, String>>()
                .map(ResponseValidator::Fields),
            SchemaSpec::Declared(other) => Err(format!(
                "a declared schema must be an object of fields, found {other}"
            )),
        }
    }

    pub fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
        match self {
            ResponseValidator::Custom(schema) => schema.validate(payload),
            ResponseValidator::Fields(fields) => {
                let mut problems = Vec::new();
                check_object(fields, payload, "$", &mut problems);
                if problems.is_empty() {
                    Ok(())
                } else {
                    Err(problems)
                }
            }
        }
    }

    pub fn fields(&self) -> Option<&ArgSpecs> {
        match self {
            ResponseValidator::Fields(fields) => Some(fields),
            ResponseValidator::Custom(_) => None,
        }
    }
}

fn check_object(fields: &ArgSpecs, value: &Value, path: &str, problems: &mut Vec<String>) {
    let Some(object) = value.as_object() else {
        problems.push(format!("{path}: expected an object"));
        return;
    };

    for (name, field) in fields {
        let field_path = format!("{path}.{name}");
        match object.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    problems.push(format!("{field_path}: missing required field"));
                }
            }
            Some(value) => check_value(field, value, &field_path, problems),
        }
    }

    for name in object.keys().filter(|name| !fields.contains_key(*name)) {
        problems.push(format!("{path}.{name}: unknown field"));
    }
}

pub(crate) fn check_value(field: &Field, value: &Value, path: &str, problems: &mut Vec<String>) {
    let conforms = match &field.kind {
        FieldKind::String | FieldKind::File => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Float => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Date => value
            .as_str()
            .is_some_and(|s| chrono::NaiveDate::parse_from_str(s, DATE_FORMAT).is_ok()),
        FieldKind::DateTime => value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
        FieldKind::Any => true,
        FieldKind::List { items } => match value.as_array() {
            Some(elements) => {
                for (i, element) in elements.iter().enumerate() {
                    check_value(items, element, &format!("{path}[{i}]"), problems);
                }
                true
            }
            None => false,
        },
        FieldKind::Nested { fields } => {
            check_object(fields, value, path, problems);
            return;
        }
    };

    if !conforms {
        problems.push(format!(
            "{path}: expected {}, found {}",
            field.kind.type_name(),
            json_type(value)
        ));
        return;
    }

    if let Some(choices) = &field.choices {
        if !choices.contains(value) {
            problems.push(format!("{path}: {value} is not one of {choices:?}"));
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn labels_schema() -> ResponseValidator {
        ResponseValidator::from_spec(SchemaSpec::Declared(json!({
            "date": {"type": "date", "required": true},
            "labels": {
                "type": "list",
                "items": {
                    "type": "nested",
                    "fields": {
                        "label": "str",
                        "probability": {"type": "float"}
                    }
                }
            }
        })))
        .unwrap()
    }

    #[rstest]
    #[case(json!({"date": "2019-01-01", "labels": [{"label": "foo", "probability": 1.0}]}))]
    #[case(json!({"date": "2019-01-01", "labels": []}))]
    #[case(json!({"date": "2019-01-01", "labels": [{"label": "foo", "probability": 1}]}))]
    #[case(json!({"date": "2019-01-01"}))]
    fn test_conforming_payloads(#[case] payload: Value) {
        assert_eq!(labels_schema().validate(&payload), Ok(()));
    }

    #[rstest]
    #[case(json!({"labels": []}), "$.date: missing required field")]
    #[case(json!({"date": "yesterday"}), "$.date: expected date, found string")]
    #[case(json!({"date": "2019-01-01", "labels": "foo"}), "$.labels: expected list, found string")]
    #[case(json!({"date": "2019-01-01", "labels": [{"label": 3}]}), "$.labels[0].label: expected string, found integer")]
    #[case(json!({"date": "2019-01-01", "extra": true}), "$.extra: unknown field")]
    #[case(json!(["not", "an", "object"]), "$: expected an object")]
    fn test_rejected_payloads(#[case] payload: Value, #[case] problem: &str) {
        let problems = labels_schema().validate(&payload).unwrap_err();
        assert!(
            problems.iter().any(|p| p == problem),
            "{problem} not in {problems:?}"
        );
    }

    #[rstest]
    #[case(json!("not an object"))]
    #[case(json!({"date": {"type": "timestamp"}}))]
    #[case(json!({"labels": {"type": "list"}}))]
    #[case(json!({"count": 3}))]
    fn test_invalid_declarations(#[case] declaration: Value) {
        assert!(ResponseValidator::from_spec(SchemaSpec::Declared(declaration)).is_err());
    }

    #[test]
    fn test_choices_and_datetime() {
        let field = Field::string().choices(["foo", "bar"]);
        assert!(field.check(&json!("foo")).is_empty());
        assert_eq!(field.check(&json!("baz")).len(), 1);

        let field = Field::datetime();
        assert!(field.check(&json!("2019-01-01T10:00:00Z")).is_empty());
        assert!(!field.check(&json!("2019-01-01")).is_empty());
    }

    #[test]
    fn test_custom_schema_is_used_as_is() {
        #[derive(Debug)]
        struct OnlyStrings;

        impl ResponseSchema for OnlyStrings {
            fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
                if payload.is_string() {
                    Ok(())
                } else {
                    Err(vec!["expected a string".into()])
                }
            }
        }

        let validator =
            ResponseValidator::from_spec(SchemaSpec::Schema(Arc::new(OnlyStrings))).unwrap();
        assert!(validator.validate(&json!("ok")).is_ok());
        assert!(validator.validate(&json!(1)).is_err());
        assert!(validator.fields().is_none());
    }

    #[test]
    fn test_field_serializes_as_declaration() {
        let field = Field::integer()
            .required()
            .description("How many")
            .choices([1, 2]);
        let declared = serde_json::to_value(&field).unwrap();
        assert_eq!(
            declared,
            json!({"type": "integer", "required": true, "description": "How many", "enum": [1, 2]})
        );
        assert_eq!(Field::from_declaration(&declared).unwrap(), field);
    }
}
