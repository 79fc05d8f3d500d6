//! Telemetry records produced by the middleware.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::type_name;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::fmt;

/// A property value. The set of value types is closed on purpose: the
/// backend only understands strings, so everything else is rendered at the
/// transport boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    String(String),
    Int(i64),
    Float(f64),
}

impl PropertyValue {
    /// Wire representation: `None` for `Null`, a string for everything else.
    pub fn to_wire(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::String(s) => Some(s.clone()),
            PropertyValue::Int(i) => Some(i.to_string()),
            PropertyValue::Float(f) => Some(f.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_wire() {
            Some(s) => f.write_str(&s),
            None => f.write_str("null"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PropertyValue::Null)
    }
}

pub type Properties = HashMap<String, PropertyValue>;
pub type Measurements = HashMap<String, f64>;

/// One completed request, as handed to the telemetry client.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub name: String,
    pub path: String,
    pub success: bool,
    pub status_code: u16,
    pub http_method: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub properties: Properties,
    pub measurements: Measurements,
}

/// An unhandled failure escaping the request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDetails {
    /// Category of the failure (error type name, or `panic`).
    pub type_name: String,
    pub value: String,
    pub trace: String,
}

impl ExceptionDetails {
    /// Build details from an error returned by the inner service.
    ///
    /// `E` is the service's declared error type and becomes the category.
    /// When `E` is a boxed trait object the category is the head of the
    /// concrete error's `Debug` output instead (`FakeError` rather than
    /// `Box<dyn Error>`); errors whose `Debug` starts with a quote, such as
    /// boxed strings, are reported as `Error`.
    pub fn from_error<E>(error: &(dyn std::error::Error + 'static)) -> Self {
        let type_name = error_category::<E>(error);
        let trace = format_trace(&type_name, error, &Backtrace::capture());
        Self {
            type_name,
            value: error.to_string(),
            trace,
        }
    }

    /// Build details from a panic payload caught at the request boundary.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let value = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());

        Self {
            type_name: "panic".to_string(),
            trace: format!("panic: {}", value),
            value,
        }
    }
}

fn error_category<E>(error: &(dyn std::error::Error + 'static)) -> String {
    let declared = type_name::<E>();
    if !declared.contains("dyn ") {
        return declared.to_string();
    }

    let head: String = format!("{:?}", error)
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if head.is_empty() {
        "Error".to_string()
    } else {
        head
    }
}

fn format_trace(
    type_name: &str,
    error: &(dyn std::error::Error + 'static),
    backtrace: &Backtrace,
) -> String {
    let mut trace = format!("{}: {}", type_name, error);
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push('\n');
        trace.push_str(&backtrace.to_string());
    }
    trace
}
