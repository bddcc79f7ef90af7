//! Sandbox-violation audit trail.
//!
//! Every attempt to escape the evaluation sandbox (forbidden operation,
//! tenant mismatch on a sink, runtime abort, compile-time rejection) is
//! recorded as its own OTLP span with forensic metadata. The logger is a
//! handle constructed once at startup and passed explicitly through the
//! pipeline; there is no global singleton.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::model::span::fresh_span_id;
use crate::model::{AttrValue, Span, SpanKind, SpanStatus};

/// Span name downstream queries depend on. Exact and stable.
pub const SANDBOX_VIOLATION_SPAN_NAME: &str = "sandbox.violation";

/// Violations in one process lifetime beyond which the tenant is flagged.
pub const DEFAULT_ATTACK_THRESHOLD: u64 = 10;

/// Frames retained in the recorded stack trace.
const MAX_STACK_FRAMES: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Breach Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A detected attempt to escape the sandbox.
///
/// `operation` and `class_name` are optional on purpose: a half-formed
/// breach report must still produce an audit span.
#[derive(Debug, Clone)]
pub struct SandboxBreach {
    pub tenant_id: String,
    /// The forbidden action, e.g. "System.exit".
    pub operation: Option<String>,
    /// The offending rule origin (class path form).
    pub class_name: Option<String>,
    pub stack: Vec<String>,
}

/// Parse the rule id out of a class path: the trailing segment when it
/// begins with "rule", else "unknown".
fn rule_id_from_class(class_name: &str) -> String {
    let trailing = class_name.rsplit('.').next().unwrap_or(class_name);
    if trailing.starts_with("rule") {
        trailing.to_string()
    } else {
        "unknown".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit Logger
// ═══════════════════════════════════════════════════════════════════════════════

/// Shapes breaches into audit spans and tracks per-tenant violation counts.
pub struct AuditLogger {
    service_name: String,
    attack_threshold: u64,
    counters: DashMap<String, AtomicU64>,
    out: mpsc::Sender<Span>,
}

impl AuditLogger {
    pub fn new(service_name: impl Into<String>, out: mpsc::Sender<Span>) -> Self {
        Self {
            service_name: service_name.into(),
            attack_threshold: DEFAULT_ATTACK_THRESHOLD,
            counters: DashMap::new(),
            out,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.attack_threshold = threshold;
        self
    }

    /// Current violation count for a tenant (this process lifetime only).
    pub fn violation_count(&self, tenant_id: &str) -> u64 {
        self.counters
            .get(tenant_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a breach: emit the audit span and bump the tenant counter.
    pub fn record(&self, breach: SandboxBreach) {
        let span = self.build_span(breach);
        if let Err(e) = self.out.try_send(span) {
            error!(error = %e, "failed to enqueue sandbox-violation span");
        }
    }

    /// Build the audit span for a breach. Never panics on missing fields.
    pub fn build_span(&self, breach: SandboxBreach) -> Span {
        let operation = breach.operation.unwrap_or_else(|| "unknown".to_string());
        let class_name = breach.class_name.unwrap_or_else(|| "unknown".to_string());
        let rule_id = rule_id_from_class(&class_name);

        let count = {
            let entry = self
                .counters
                .entry(breach.tenant_id.clone())
                .or_insert_with(|| AtomicU64::new(0));
            entry.fetch_add(1, Ordering::Relaxed) + 1
        };
        counter!("betrace_sandbox_violations").increment(1);

        warn!(
            tenant_id = %breach.tenant_id,
            operation = %operation,
            class_name = %class_name,
            count,
            "sandbox violation detected"
        );

        let stack = breach
            .stack
            .iter()
            .take(MAX_STACK_FRAMES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let now = Utc::now();
        let now_nanos = now.timestamp_nanos_opt().unwrap_or(0) as u64;

        let mut attributes = BTreeMap::from([
            (
                "event.type".to_string(),
                AttrValue::from("security.sandbox.violation"),
            ),
            ("tenant.id".to_string(), AttrValue::from(breach.tenant_id)),
            ("violation.operation".to_string(), AttrValue::from(operation)),
            ("violation.className".to_string(), AttrValue::from(class_name)),
            ("violation.ruleId".to_string(), AttrValue::from(rule_id)),
            ("violation.stackTrace".to_string(), AttrValue::from(stack)),
            (
                "violation.timestamp".to_string(),
                AttrValue::Int(now.timestamp_millis()),
            ),
            ("compliance.framework".to_string(), AttrValue::from("soc2")),
            ("compliance.control".to_string(), AttrValue::from("CC7.2")),
            (
                "compliance.evidenceType".to_string(),
                AttrValue::from("audit_trail"),
            ),
        ]);

        if count > self.attack_threshold {
            attributes.insert("violation.possibleAttack".to_string(), AttrValue::Bool(true));
            attributes.insert("violation.count".to_string(), AttrValue::Int(count as i64));
        }

        Span {
            span_id: fresh_span_id(),
            trace_id: hex::encode(uuid::Uuid::new_v4().into_bytes()),
            parent_span_id: None,
            operation_name: SANDBOX_VIOLATION_SPAN_NAME.to_string(),
            service_name: self.service_name.clone(),
            start_time_unix_nano: now_nanos,
            end_time_unix_nano: now_nanos,
            kind: SpanKind::Internal,
            status: SpanStatus::Error,
            attributes,
            resource_attributes: BTreeMap::from([(
                "service.name".to_string(),
                self.service_name.clone(),
            )]),
            tenant_id: String::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> (AuditLogger, mpsc::Receiver<Span>) {
        let (tx, rx) = mpsc::channel(64);
        (AuditLogger::new("betrace-processor", tx), rx)
    }

    fn breach(op: Option<&str>, class: Option<&str>) -> SandboxBreach {
        SandboxBreach {
            tenant_id: "t1".into(),
            operation: op.map(String::from),
            class_name: class.map(String::from),
            stack: vec!["frame.one".into(), "frame.two".into()],
        }
    }

    #[test]
    fn test_span_name_and_core_attributes() {
        let (logger, _rx) = logger();
        let span = logger.build_span(breach(Some("System.exit"), Some("com.acme.rule042")));

        assert_eq!(span.operation_name, "sandbox.violation");
        assert_eq!(
            span.attribute("event.type").unwrap().as_str(),
            Some("security.sandbox.violation")
        );
        assert_eq!(
            span.attribute("violation.operation").unwrap().as_str(),
            Some("System.exit")
        );
        assert_eq!(
            span.attribute("violation.ruleId").unwrap().as_str(),
            Some("rule042")
        );
        assert_eq!(
            span.attribute("compliance.control").unwrap().as_str(),
            Some("CC7.2")
        );
    }

    #[test]
    fn test_null_fields_become_unknown() {
        let (logger, _rx) = logger();
        let span = logger.build_span(breach(None, None));

        assert_eq!(
            span.attribute("violation.operation").unwrap().as_str(),
            Some("unknown")
        );
        assert_eq!(
            span.attribute("violation.className").unwrap().as_str(),
            Some("unknown")
        );
        assert_eq!(
            span.attribute("violation.ruleId").unwrap().as_str(),
            Some("unknown")
        );
    }

    #[test]
    fn test_rule_id_requires_rule_prefix() {
        let (logger, _rx) = logger();
        let span = logger.build_span(breach(Some("Runtime.exec"), Some("com.acme.Helper")));
        assert_eq!(
            span.attribute("violation.ruleId").unwrap().as_str(),
            Some("unknown")
        );
    }

    #[test]
    fn test_attack_flag_appears_above_threshold() {
        let (logger, _rx) = logger();

        for i in 1..=10u64 {
            let span = logger.build_span(breach(Some("System.exit"), None));
            assert!(
                span.attribute("violation.possibleAttack").is_none(),
                "violation {} must not be flagged",
                i
            );
            assert!(span.attribute("violation.count").is_none());
        }

        let eleventh = logger.build_span(breach(Some("System.exit"), None));
        assert_eq!(
            eleventh.attribute("violation.possibleAttack").unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(
            eleventh.attribute("violation.count").unwrap().as_f64(),
            Some(11.0)
        );
    }

    #[test]
    fn test_counters_are_per_tenant() {
        let (logger, _rx) = logger();
        logger.build_span(breach(Some("x"), None));
        let mut other = breach(Some("x"), None);
        other.tenant_id = "t2".into();
        logger.build_span(other);

        assert_eq!(logger.violation_count("t1"), 1);
        assert_eq!(logger.violation_count("t2"), 1);
    }

    #[test]
    fn test_stack_trace_truncated_to_ten_frames() {
        let (logger, _rx) = logger();
        let mut b = breach(Some("x"), None);
        b.stack = (0..25).map(|i| format!("frame.{}", i)).collect();
        let span = logger.build_span(b);

        let stack = span
            .attribute("violation.stackTrace")
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(stack.lines().count(), 10);
    }

    #[tokio::test]
    async fn test_record_enqueues_span() {
        let (tx, mut rx) = mpsc::channel(4);
        let logger = AuditLogger::new("betrace-processor", tx);
        logger.record(breach(Some("System.exit"), None));

        let span = rx.recv().await.unwrap();
        assert_eq!(span.operation_name, "sandbox.violation");
    }
}
