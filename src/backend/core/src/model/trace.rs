//! Trace: the set of all spans sharing one trace id.

use serde::{Deserialize, Serialize};

use super::span::Span;

/// The evaluation subject for a rule.
///
/// Invariant: all spans share one trace id. The assembler owns the only
/// mutation path; the evaluator receives traces behind `Arc` and treats them
/// as frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<Span>,
    /// Set when the trace hit its max in-memory age and was evaluated as-is.
    #[serde(default)]
    pub truncated: bool,
}

impl Trace {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans: Vec::new(),
            truncated: false,
        }
    }

    /// Add a span. The caller guarantees the trace id matches.
    pub fn push(&mut self, span: Span) {
        debug_assert_eq!(span.trace_id, self.trace_id);
        self.spans.push(span);
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Computed duration: max end - min start, clamped at zero.
    pub fn duration_nanos(&self) -> u64 {
        let min_start = self
            .spans
            .iter()
            .map(|s| s.start_time_unix_nano)
            .min()
            .unwrap_or(0);
        let max_end = self
            .spans
            .iter()
            .map(|s| s.end_time_unix_nano)
            .max()
            .unwrap_or(0);
        max_end.saturating_sub(min_start)
    }

    /// The nominated root: first span without a parent, else the earliest.
    pub fn root_span(&self) -> Option<&Span> {
        self.spans
            .iter()
            .find(|s| s.parent_span_id.is_none())
            .or_else(|| self.spans.iter().min_by_key(|s| s.start_time_unix_nano))
    }

    /// Spans whose operation name equals `operation`.
    pub fn spans_named<'a>(&'a self, operation: &'a str) -> impl Iterator<Item = &'a Span> {
        self.spans
            .iter()
            .filter(move |s| s.operation_name == operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::span::{AttrValue, SpanKind, SpanStatus};
    use std::collections::BTreeMap;

    fn span(id: &str, parent: Option<&str>, start: u64, end: u64) -> Span {
        Span {
            span_id: format!("{:0>16}", id),
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".into(),
            parent_span_id: parent.map(|p| format!("{:0>16}", p)),
            operation_name: "op".into(),
            service_name: "svc".into(),
            start_time_unix_nano: start,
            end_time_unix_nano: end,
            kind: SpanKind::Internal,
            status: SpanStatus::Unset,
            attributes: BTreeMap::from([("k".to_string(), AttrValue::Int(1))]),
            resource_attributes: BTreeMap::new(),
            tenant_id: "default".into(),
        }
    }

    #[test]
    fn test_duration_is_max_end_minus_min_start() {
        let mut trace = Trace::new("4bf92f3577b34da6a3ce929d0e0e4736");
        trace.push(span("a", None, 100, 400));
        trace.push(span("b", Some("a"), 150, 900));
        assert_eq!(trace.duration_nanos(), 800);
    }

    #[test]
    fn test_duration_clamps_at_zero_for_empty() {
        let trace = Trace::new("4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(trace.duration_nanos(), 0);
    }

    #[test]
    fn test_root_is_first_parentless_span() {
        let mut trace = Trace::new("4bf92f3577b34da6a3ce929d0e0e4736");
        trace.push(span("b", Some("a"), 150, 900));
        trace.push(span("a", None, 100, 400));
        assert_eq!(trace.root_span().unwrap().span_id, format!("{:0>16}", "a"));
    }

    #[test]
    fn test_root_falls_back_to_earliest() {
        let mut trace = Trace::new("4bf92f3577b34da6a3ce929d0e0e4736");
        trace.push(span("b", Some("x"), 150, 900));
        trace.push(span("c", Some("x"), 120, 400));
        assert_eq!(trace.root_span().unwrap().span_id, format!("{:0>16}", "c"));
    }
}
