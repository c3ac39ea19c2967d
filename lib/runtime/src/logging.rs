// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! modelserve logging.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `MODELSERVE_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `MODELSERVE_LOGGING_JSONL` environment variable to `1`.
//!
//! All output goes to stderr. Worker processes use stdout for their job protocol.
//!
//! Filters can be configured using the `MODELSERVE_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file.
//!
//! Example:
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "modelserve_model" = "info"
//! "modelserve_runtime::pool" = "trace"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Once, OnceLock};

use axum::http::Request;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Span, Subscriber};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatFields, FormattedFields};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{filter::Directive, fmt};

use crate::config::environment_names::logging as env_logging;
use crate::config::{disable_ansi_logging, jsonl_logging_enabled};

/// Default log level when neither the environment nor a config file sets one
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Upper bound for the in-memory debug capture; older output is dropped first
const DEBUG_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

static DEBUG_BUFFER: OnceLock<DebugBuffer> = OnceLock::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("hyper".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("axum".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Options applied when the global subscriber is installed
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Also copy every event into an in-memory buffer served by the debug endpoint
    pub capture_debug: bool,
}

/// Initialize the logger with default options
pub fn init() {
    init_with(LoggingOptions::default())
}

/// Initialize the logger. Only the first call has any effect.
pub fn init_with(options: LoggingOptions) {
    INIT.call_once(|| {
        if let Err(e) = setup_logging(&options) {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    });
}

/// The debug capture buffer, if logging was initialized with `capture_debug`
pub fn debug_buffer() -> Option<DebugBuffer> {
    DEBUG_BUFFER.get().cloned()
}

fn setup_logging(options: &LoggingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let debug_layer = if options.capture_debug {
        let buffer = DEBUG_BUFFER.get_or_init(DebugBuffer::default).clone();
        Some(
            fmt::layer()
                .with_ansi(false)
                .event_format(fmt::format().with_timer(TimeFormatter::new()))
                .with_writer(buffer)
                .with_filter(filters(load_config()?)),
        )
    } else {
        None
    };

    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .with_ansi(false)
            .event_format(CustomJsonFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filters(load_config()?));
        tracing_subscriber::registry()
            .with(debug_layer)
            .with(l)
            .try_init()?;
    } else {
        let l = fmt::layer()
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filters(load_config()?));
        tracing_subscriber::registry()
            .with(debug_layer)
            .with(l)
            .try_init()?;
    }

    if options.capture_debug {
        tracing::warn!(
            "Running with the debug endpoint enabled: all log output is exposed on /debug. \
             Disable it once you have finished debugging."
        );
    }
    Ok(())
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(env_logging::MODELSERVE_LOG)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> Result<LoggingConfig, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(env_logging::MODELSERVE_LOGGING_CONFIG_PATH) {
        if !path.is_empty() {
            figment = figment.merge(Toml::file(path));
        }
    }
    figment.extract()
}

/// Takes an axum request and returns the span used to trace it
pub fn make_request_span<B>(req: &Request<B>) -> Span {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::info_span!(
        "http-request",
        method = %req.method(),
        uri = %req.uri(),
        version = ?req.version(),
        x_request_id = %request_id,
    )
}

/// Shared, bounded copy of the log output
#[derive(Clone, Default, Debug)]
pub struct DebugBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl DebugBuffer {
    /// Everything captured so far, lossily decoded as UTF-8
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    /// Append a line directly, bypassing the subscriber
    pub fn append_line(&self, line: &str) {
        let mut buf = self.inner.lock();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        trim_front(&mut buf);
    }
}

fn trim_front(buf: &mut Vec<u8>) {
    if buf.len() > DEBUG_BUFFER_LIMIT {
        let excess = buf.len() - DEBUG_BUFFER_LIMIT;
        buf.drain(..excess);
    }
}

pub struct DebugWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for DebugWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.inner.lock();
        buf.extend_from_slice(data);
        trim_front(&mut buf);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DebugBuffer {
    type Writer = DebugWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DebugWriter {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Serialize)]
struct JsonLog<'a> {
    time: String,
    level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    target: &'a str,
    message: Value,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: crate::config::use_local_timezone(),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

struct CustomJsonFormatter {
    time_formatter: TimeFormatter,
}

impl CustomJsonFormatter {
    fn new() -> Self {
        Self {
            time_formatter: TimeFormatter::new(),
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomJsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .fields
            .remove("message")
            .unwrap_or(Value::String(String::new()));

        // span fields are recorded as `key=value` pairs by the field formatter
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let ext = span.extensions();
                if let Some(data) = ext.get::<FormattedFields<N>>() {
                    for (name, value) in data
                        .fields
                        .split(' ')
                        .filter_map(|entry| entry.split_once('='))
                    {
                        visitor.fields.insert(
                            name.to_string(),
                            Value::String(value.trim_matches('"').to_string()),
                        );
                    }
                }
                visitor
                    .fields
                    .insert("span_name".to_string(), Value::String(span.name().to_string()));
            }
        }

        let metadata = event.metadata();
        let log = JsonLog {
            level: metadata.level().to_string(),
            time: self.time_formatter.format_now(),
            file: metadata.file(),
            line: metadata.line(),
            target: metadata.target(),
            message,
            fields: visitor.fields,
        };
        let json = serde_json::to_string(&log).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: BTreeMap<String, Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        use serde_json::value::Number;
        self.fields.insert(
            field.name().to_string(),
            Value::Number(Number::from_f64(value).unwrap_or(0.into())),
        );
    }
}
