//! Violation & evidence span shaping.
//!
//! Every match becomes a fresh OTLP span carrying the originating trace id,
//! so violations correlate with their traces in the downstream store. The
//! processor is strictly additive: original application spans are forwarded
//! unchanged in the same export batch, never edited or dropped.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluator::ViolationRecord;
use crate::model::span::fresh_span_id;
use crate::model::{AttrValue, Span, SpanKind, SpanStatus};

/// Span names downstream queries depend on. Exact and stable.
pub const VIOLATION_SPAN_NAME: &str = "betrace.violation.detected";
pub const EVIDENCE_SPAN_NAME: &str = "betrace.compliance.evidence";

// ═══════════════════════════════════════════════════════════════════════════════
// Evidence Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceOutcome {
    Success,
    Failure,
}

impl EvidenceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// A compliance event to be emitted as a signed evidence span.
#[derive(Debug, Clone)]
pub struct EvidenceEvent {
    pub tenant_id: String,
    pub trace_id: String,
    pub framework: String,
    pub control: String,
    pub evidence_type: String,
    pub outcome: EvidenceOutcome,
    pub timestamp: DateTime<Utc>,
}

impl EvidenceEvent {
    /// Evidence that PII redaction ran for a violation on this trace.
    pub fn pii_redaction(tenant_id: &str, trace_id: &str, outcome: EvidenceOutcome) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            trace_id: trace_id.to_string(),
            framework: "soc2".to_string(),
            control: "CC6.7".to_string(),
            evidence_type: "pii_redaction".to_string(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// RFC-3339 UTC form used both as an attribute and in the canonical
    /// signing string.
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Emitter
// ═══════════════════════════════════════════════════════════════════════════════

/// Shapes violation records and evidence events into OTLP spans.
pub struct SpanEmitter {
    service_name: String,
}

impl SpanEmitter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Shape a violation record whose context has already been redacted.
    pub fn violation_span(
        &self,
        record: &ViolationRecord,
        redacted_context: BTreeMap<String, AttrValue>,
    ) -> Span {
        let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;

        let mut attributes = redacted_context;
        attributes.insert(
            "betrace.violation.rule_id".to_string(),
            AttrValue::from(record.rule_id.clone()),
        );
        attributes.insert(
            "betrace.violation.rule_name".to_string(),
            AttrValue::from(record.rule_name.clone()),
        );
        attributes.insert(
            "betrace.violation.severity".to_string(),
            AttrValue::from(record.severity.as_str()),
        );
        attributes.insert(
            "betrace.violation.description".to_string(),
            AttrValue::from(record.description.clone()),
        );

        Span {
            span_id: fresh_span_id(),
            trace_id: record.trace_id.clone(),
            parent_span_id: None,
            operation_name: VIOLATION_SPAN_NAME.to_string(),
            service_name: self.service_name.clone(),
            start_time_unix_nano: now_nanos,
            end_time_unix_nano: now_nanos,
            kind: SpanKind::Internal,
            status: SpanStatus::Unset,
            attributes,
            resource_attributes: BTreeMap::from([(
                "service.name".to_string(),
                self.service_name.clone(),
            )]),
            tenant_id: record.tenant_id.clone(),
        }
    }

    /// Shape an evidence event. The signature attribute is attached by the
    /// signer afterwards.
    pub fn evidence_span(&self, event: &EvidenceEvent) -> Span {
        let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;

        let attributes = BTreeMap::from([
            (
                "betrace.compliance.framework".to_string(),
                AttrValue::from(event.framework.clone()),
            ),
            (
                "betrace.compliance.control".to_string(),
                AttrValue::from(event.control.clone()),
            ),
            (
                "betrace.compliance.evidenceType".to_string(),
                AttrValue::from(event.evidence_type.clone()),
            ),
            (
                "betrace.compliance.outcome".to_string(),
                AttrValue::from(event.outcome.as_str()),
            ),
            (
                "betrace.compliance.timestamp".to_string(),
                AttrValue::from(event.timestamp_rfc3339()),
            ),
        ]);

        Span {
            span_id: fresh_span_id(),
            trace_id: event.trace_id.clone(),
            parent_span_id: None,
            operation_name: EVIDENCE_SPAN_NAME.to_string(),
            service_name: self.service_name.clone(),
            start_time_unix_nano: now_nanos,
            end_time_unix_nano: now_nanos,
            kind: SpanKind::Internal,
            status: SpanStatus::Unset,
            attributes,
            resource_attributes: BTreeMap::from([(
                "service.name".to_string(),
                self.service_name.clone(),
            )]),
            tenant_id: event.tenant_id.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
