//! Span model: the atomic unit of the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Attribute Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A span attribute value.
///
/// Cloning is a deep copy for every variant, which is what the sandboxed
/// evaluator relies on when it hands span collections to expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// View as a string slice, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Rough payload size in bytes, used for sandbox memory accounting.
    pub fn approx_size(&self) -> u64 {
        match self {
            Self::Str(s) => s.len() as u64,
            Self::Int(_) | Self::Float(_) | Self::Bool(_) => 8,
            Self::List(items) => items.iter().map(AttrValue::approx_size).sum::<u64>() + 8,
            Self::Map(entries) => {
                entries
                    .iter()
                    .map(|(k, v)| k.len() as u64 + v.approx_size())
                    .sum::<u64>()
                    + 8
            }
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Self::Map(entries) => {
                let parts: Vec<String> =
                    entries.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Span Kind & Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Server,
    Client,
    Internal,
    Producer,
    Consumer,
}

impl Default for SpanKind {
    fn default() -> Self {
        Self::Internal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

impl Default for SpanStatus {
    fn default() -> Self {
        Self::Unset
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Span
// ═══════════════════════════════════════════════════════════════════════════════

/// One timed operation with attributes.
///
/// Invariants enforced by [`Span::validate`]: 32-hex trace id, 16-hex span id,
/// start <= end, a present start timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// 16 lowercase hex characters
    pub span_id: String,

    /// 32 lowercase hex characters
    pub trace_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub operation_name: String,

    pub service_name: String,

    /// Nanoseconds since the Unix epoch
    pub start_time_unix_nano: u64,

    /// Nanoseconds since the Unix epoch
    pub end_time_unix_nano: u64,

    #[serde(default)]
    pub kind: SpanKind,

    #[serde(default)]
    pub status: SpanStatus,

    /// Dotted-namespace attribute keys
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,

    /// Resource-level attributes (flattened string form)
    #[serde(default)]
    pub resource_attributes: BTreeMap<String, String>,

    /// Deployment tenant identity, attached at the receiver boundary
    #[serde(default)]
    pub tenant_id: String,
}

/// Validation failures for an incoming span.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpanValidationError {
    #[error("trace id must be 32 hex characters, got {0:?}")]
    InvalidTraceId(String),

    #[error("span id must be 16 hex characters, got {0:?}")]
    InvalidSpanId(String),

    #[error("missing start timestamp")]
    MissingTimestamp,

    #[error("span ends before it starts ({start} > {end})")]
    NegativeDuration { start: u64, end: u64 },
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Span {
    /// Validate the receiver-boundary invariants.
    pub fn validate(&self) -> Result<(), SpanValidationError> {
        if !is_hex_of_len(&self.trace_id, 32) {
            return Err(SpanValidationError::InvalidTraceId(self.trace_id.clone()));
        }
        if !is_hex_of_len(&self.span_id, 16) {
            return Err(SpanValidationError::InvalidSpanId(self.span_id.clone()));
        }
        if self.start_time_unix_nano == 0 {
            return Err(SpanValidationError::MissingTimestamp);
        }
        if self.end_time_unix_nano != 0 && self.start_time_unix_nano > self.end_time_unix_nano {
            return Err(SpanValidationError::NegativeDuration {
                start: self.start_time_unix_nano,
                end: self.end_time_unix_nano,
            });
        }
        Ok(())
    }

    /// Whether the span has ended.
    pub fn has_ended(&self) -> bool {
        self.end_time_unix_nano != 0
    }

    /// Span duration in nanoseconds (0 while still open).
    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }

    /// Look up an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Rough payload size in bytes, used for sandbox memory accounting.
    pub fn approx_size(&self) -> u64 {
        let attrs: u64 = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() as u64 + v.approx_size())
            .sum();
        let resource: u64 = self
            .resource_attributes
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        self.span_id.len() as u64
            + self.trace_id.len() as u64
            + self.operation_name.len() as u64
            + self.service_name.len() as u64
            + attrs
            + resource
            + 64
    }
}

/// Generate a fresh 16-hex span id.
pub fn fresh_span_id() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    hex::encode(&bytes[..8])
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
