//! The uniform measurement record produced by every parser, plus the
//! line-protocol serializer and the sinks that carry records downstream.

mod line_protocol;
mod sink;

pub use self::line_protocol::{format_line, parse_line};
pub use self::sink::{Output, OutputKind, SinkError};

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single field value. Parsers only emit values that are numerically
/// coercible, but the coercion sometimes keeps the device's own textual
/// rendering (e.g. `"0.59"`), so text is a first-class variant.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// One record of the output stream: measurement name, tag set, field set and
/// a nanosecond timestamp. A point exists only between parser emission and
/// the sink write; nothing stores it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Point {
    /// `None` until either the parser's measurement override or the
    /// command-derived default is applied.
    pub measurement: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new() -> Point {
        Point::default()
    }

    /// Inserts a tag, scrubbing characters that would corrupt the line
    /// protocol (space, `=`, `,`) into underscores.
    pub fn insert_tag(&mut self, key: impl Into<String>, value: &str) {
        self.tags.insert(key.into(), scrub_tag_value(value));
    }

    pub fn insert_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Stamps the point with the current wall-clock time.
    pub fn stamp(&mut self) {
        self.timestamp_ns = now_ns();
    }
}

/// Replaces the line-protocol separator characters in a tag value.
pub fn scrub_tag_value(value: &str) -> String {
    value.replace(' ', "_").replace('=', "_").replace(',', "_")
}

/// Nanoseconds since the unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
