//! Core data model: spans, traces, and attribute values.
//!
//! Spans are created externally and arrive on the receiver boundary; the
//! pipeline never mutates them. Traces exist only in memory and are discarded
//! after evaluation.

pub mod span;
pub mod trace;

pub use span::{AttrValue, Span, SpanKind, SpanStatus, SpanValidationError};
pub use trace::Trace;
