// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OpenAPI documentation generation and Swagger UI integration
//!
//! The specification is built from the [`RouteDoc`]s of every mounted route. Routes that
//! carry argument declarations document them: plain arguments as query parameters, file
//! and form arguments as a `multipart/form-data` request body.
//!
//! ## Endpoints
//!
//! - `GET /openapi.json` - Returns the OpenAPI specification in JSON format
//! - `GET /docs` - Serves the Swagger UI interface for interactive API exploration

use axum::http::Method;
use axum::Router;
use utoipa::openapi::path::{Operation, OperationBuilder, ParameterBuilder, ParameterIn};
use utoipa::openapi::request_body::RequestBodyBuilder;
use utoipa::openapi::schema::{
    ArrayBuilder, KnownFormat, ObjectBuilder, Schema, SchemaFormat, SchemaType, Type,
};
use utoipa::openapi::{ContentBuilder, PathItem, Paths, RefOr, Required, ResponseBuilder};
use utoipa::OpenApi;

use crate::http::service::RouteDoc;
use crate::schema::{ArgSpecs, Field, FieldKind, Location};

const OPENAPI_PATH: &str = "/openapi.json";
const DOCS_PATH: &str = "/docs";

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Modelserve API",
        version = env!("CARGO_PKG_VERSION"),
        description = "Serve machine learning models over a uniform HTTP API.",
        license(name = "Apache-2.0")
    ),
    servers(
        (url = "/", description = "Current server")
    )
)]
struct ApiDoc;

/// Generate OpenAPI specification from route documentation
fn generate_openapi_spec(route_docs: &[RouteDoc]) -> utoipa::openapi::OpenApi {
    let mut openapi = ApiDoc::openapi();
    let mut paths = Paths::new();

    for route in route_docs {
        tracing::debug!("Adding route to OpenAPI spec: {}", route);

        let operation = create_operation_for_route(route);
        let item: &mut PathItem = paths.paths.entry(route.path().to_string()).or_default();
        match route.method().as_str() {
            "GET" => item.get = Some(operation),
            "POST" => item.post = Some(operation),
            "PUT" => item.put = Some(operation),
            "DELETE" => item.delete = Some(operation),
            "PATCH" => item.patch = Some(operation),
            other => tracing::warn!("Unsupported HTTP method in route docs: {}", other),
        }
    }

    openapi.paths = paths;
    openapi
}

fn create_operation_for_route(route: &RouteDoc) -> Operation {
    let method = route.method().as_str().to_lowercase();
    let operation_id = format!(
        "{}_{}",
        method,
        route
            .path()
            .replace(['/', '{', '}', '-'], "_")
            .trim_matches('_')
    );

    let mut operation = OperationBuilder::new()
        .operation_id(Some(operation_id))
        .summary(route.summary().map(str::to_string));

    if let Some(args) = route.args() {
        operation = add_arguments(operation, args);
    }

    operation
        .response(
            "200",
            ResponseBuilder::new()
                .description("Successful response")
                .build(),
        )
        .response(
            "400",
            ResponseBuilder::new()
                .description("Bad request - invalid input")
                .build(),
        )
        .response(
            "404",
            ResponseBuilder::new().description("Not found").build(),
        )
        .response(
            "500",
            ResponseBuilder::new()
                .description("Model error, see the error reference in the server logs")
                .build(),
        )
        .build()
}

/// Query parameters for plain arguments, a multipart body for files and form fields
fn add_arguments(mut operation: OperationBuilder, args: &ArgSpecs) -> OperationBuilder {
    let mut form = ObjectBuilder::new();
    let mut has_form = false;

    for (name, field) in args {
        let in_body = field.is_file()
            || matches!(field.location, Some(Location::Form | Location::Files));
        if in_body {
            has_form = true;
            form = form.property(name, field_schema(field));
            if field.required {
                form = form.required(name);
            }
            continue;
        }

        operation = operation.parameter(
            ParameterBuilder::new()
                .name(name)
                .parameter_in(ParameterIn::Query)
                .required(if field.required {
                    Required::True
                } else {
                    Required::False
                })
                .description(field.description.clone())
                .schema(Some(field_schema(field))),
        );
    }

    if has_form {
        operation = operation.request_body(Some(
            RequestBodyBuilder::new()
                .content(
                    "multipart/form-data",
                    ContentBuilder::new().schema(Some(form.build())).build(),
                )
                .build(),
        ));
    }
    operation
}

fn field_schema(field: &Field) -> RefOr<Schema> {
    let builder = match &field.kind {
        FieldKind::List { items } => {
            let mut array = ArrayBuilder::new().items(field_schema(items));
            if let Some(description) = &field.description {
                array = array.description(Some(description.clone()));
            }
            return RefOr::T(Schema::Array(array.build()));
        }
        FieldKind::Nested { fields } => {
            let mut object = ObjectBuilder::new().schema_type(SchemaType::Type(Type::Object));
            for (name, nested) in fields {
                object = object.property(name, field_schema(nested));
                if nested.required {
                    object = object.required(name);
                }
            }
            object
        }
        FieldKind::String => ObjectBuilder::new().schema_type(SchemaType::Type(Type::String)),
        FieldKind::Integer => ObjectBuilder::new().schema_type(SchemaType::Type(Type::Integer)),
        FieldKind::Float => ObjectBuilder::new().schema_type(SchemaType::Type(Type::Number)),
        FieldKind::Boolean => ObjectBuilder::new().schema_type(SchemaType::Type(Type::Boolean)),
        FieldKind::Date => ObjectBuilder::new()
            .schema_type(SchemaType::Type(Type::String))
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::Date))),
        FieldKind::DateTime => ObjectBuilder::new()
            .schema_type(SchemaType::Type(Type::String))
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::DateTime))),
        FieldKind::File => ObjectBuilder::new()
            .schema_type(SchemaType::Type(Type::String))
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::Binary))),
        FieldKind::Any => ObjectBuilder::new(),
    };

    RefOr::T(Schema::Object(
        builder
            .description(field.description.clone())
            .enum_values(field.choices.clone())
            .default(field.default.clone())
            .build(),
    ))
}

pub fn openapi_router(route_docs: Vec<RouteDoc>, _path: Option<String>) -> (Vec<RouteDoc>, Router) {
    use utoipa_swagger_ui::SwaggerUi;

    let mut route_docs = route_docs;
    route_docs.push(RouteDoc::new(Method::GET, OPENAPI_PATH).with_summary("OpenAPI specification"));
    route_docs.push(RouteDoc::new(Method::GET, DOCS_PATH).with_summary("Swagger UI"));

    let openapi_spec = generate_openapi_spec(&route_docs);

    // SwaggerUi needs a static path, so the document is always served at /openapi.json
    let swagger_ui = SwaggerUi::new(DOCS_PATH).url(OPENAPI_PATH, openapi_spec);
    let router = Router::new().merge(swagger_ui);

    let docs = vec![
        RouteDoc::new(Method::GET, OPENAPI_PATH),
        RouteDoc::new(Method::GET, DOCS_PATH),
    ];

    (docs, router)
}
