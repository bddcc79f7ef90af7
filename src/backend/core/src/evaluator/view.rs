//! Read-only trace view: the only window an expression gets on span data.
//!
//! The view is closed over a single trace; there is no navigation to other
//! traces, no handle to services or storage, and the tenant id is fixed at
//! construction. Span collections leave the view as defensive deep copies,
//! charged against the evaluation's memory budget.

use std::sync::Arc;

use crate::model::{Span, Trace};

use super::budget::{EvalAbort, EvalBudget};

pub struct SpanView {
    trace: Arc<Trace>,
    tenant_id: String,
    budget: Arc<EvalBudget>,
}

impl SpanView {
    pub fn new(trace: Arc<Trace>, tenant_id: impl Into<String>, budget: Arc<EvalBudget>) -> Self {
        Self {
            trace,
            tenant_id: tenant_id.into(),
            budget,
        }
    }

    /// The fixed tenant identity; expressions cannot alter it.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn span_count(&self) -> usize {
        self.trace.span_count()
    }

    pub fn duration_nanos(&self) -> u64 {
        self.trace.duration_nanos()
    }

    /// Deep copies of every span, charged to the memory budget.
    pub fn spans(&self) -> Result<Vec<Span>, EvalAbort> {
        let mut out = Vec::with_capacity(self.trace.spans.len());
        for span in &self.trace.spans {
            self.budget.charge(span.approx_size())?;
            out.push(span.clone());
        }
        Ok(out)
    }

    /// Deep copies of the spans with the given operation name.
    pub fn spans_named(&self, operation: &str) -> Result<Vec<Span>, EvalAbort> {
        let mut out = Vec::new();
        for span in self.trace.spans_named(operation) {
            self.budget.charge(span.approx_size())?;
            out.push(span.clone());
        }
        Ok(out)
    }

    /// Count spans with the given operation name. Returns a primitive, so no
    /// copy is made or charged.
    pub fn count_named(&self, operation: &str) -> usize {
        self.trace.spans_named(operation).count()
    }
}
