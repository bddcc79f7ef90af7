//! Sandboxed rule evaluation.
//!
//! Expressions run against a read-only [`SpanView`] and report through an
//! append-only [`ViolationSink`]; those two capabilities are everything an
//! expression can reach. The walker interprets the compiled AST directly,
//! checking the CPU budget between nodes and charging defensive copies to
//! the memory ceiling. Breaches of any kind route to the audit logger and
//! terminate the offending rule only; the trace continues through the
//! remaining rules.

pub mod budget;
pub mod sink;
pub mod view;

pub use budget::{BudgetScope, EvalAbort, EvalBudget};
pub use sink::{TenantMismatch, ViolationRecord, ViolationSink};
pub use view::SpanView;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use crate::audit::{AuditLogger, SandboxBreach};
use crate::config::RuleConfig;
use crate::dsl::{
    CmpOp, CompileError, ExpressionCache, Filter, Literal, Predicate, RuleExpr,
};
use crate::model::{AttrValue, Span, Trace};
use crate::rules::{RuleDefinition, RuleSnapshot};

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-rule evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Matched,
    NotMatched,
    Errored,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub status: RuleStatus,
    pub error: Option<String>,
    /// Set when the error came from compilation; the registry marks the
    /// rule inert so it stops being scheduled.
    pub compile_failed: bool,
}

#[derive(Debug, Default)]
pub struct EvaluationResult {
    pub violations: Vec<ViolationRecord>,
    pub outcomes: Vec<RuleOutcome>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluator
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluates every active rule against one trace at a time.
///
/// Retains no state across traces: rate-based detection belongs to
/// downstream aggregation over the stored violation stream.
pub struct SandboxedEvaluator {
    tenant_id: String,
    config: RuleConfig,
    cache: Arc<ExpressionCache>,
    audit: Arc<AuditLogger>,
}

impl SandboxedEvaluator {
    pub fn new(
        tenant_id: impl Into<String>,
        config: RuleConfig,
        cache: Arc<ExpressionCache>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            config,
            cache,
            audit,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Evaluate all active rules against a trace.
    ///
    /// The cancellation flag is checked between rules so shutdown can stop
    /// an in-flight batch cooperatively.
    pub fn evaluate(
        &self,
        trace: Arc<Trace>,
        rules: &RuleSnapshot,
        cancel: &AtomicBool,
    ) -> EvaluationResult {
        let mut result = EvaluationResult::default();

        for rule in rules.active_rules() {
            if cancel.load(Ordering::Relaxed) {
                debug!(trace_id = %trace.trace_id, "evaluation cancelled between rules");
                break;
            }
            self.evaluate_rule(rule, &trace, &mut result);
        }

        result
    }

    fn evaluate_rule(&self, rule: &RuleDefinition, trace: &Arc<Trace>, result: &mut EvaluationResult) {
        let compiled = match self.cache.get_or_compile(rule) {
            Ok(c) => c,
            Err(CompileError::SandboxRejected { operation }) => {
                // The rule is never evaluated; the attempt goes to the audit trail.
                let known_host_routine =
                    crate::dsl::FORBIDDEN_OPERATIONS.contains(&operation.as_str());
                debug!(
                    rule_id = %rule.id,
                    operation = %operation,
                    known_host_routine,
                    "compiled form resolved to a forbidden operation"
                );
                self.audit.record(SandboxBreach {
                    tenant_id: self.tenant_id.clone(),
                    operation: Some(operation.clone()),
                    class_name: Some(format!("betrace.rules.{}", rule.id)),
                    stack: rule_stack(&rule.id, "compile"),
                });
                result.outcomes.push(RuleOutcome {
                    rule_id: rule.id.clone(),
                    status: RuleStatus::Aborted,
                    error: Some(format!("forbidden operation: {}", operation)),
                    compile_failed: true,
                });
                return;
            }
            Err(e) => {
                result.outcomes.push(RuleOutcome {
                    rule_id: rule.id.clone(),
                    status: RuleStatus::Errored,
                    error: Some(e.to_string()),
                    compile_failed: true,
                });
                return;
            }
        };

        let budget = EvalBudget::start(&self.config);
        let _scope = BudgetScope::new(budget.clone());
        let view = SpanView::new(trace.clone(), self.tenant_id.clone(), budget.clone());
        let sink = ViolationSink::new(self.tenant_id.clone());

        match eval_rule_expr(&compiled.expr, &view, &budget) {
            Ok(false) => {
                result.outcomes.push(RuleOutcome {
                    rule_id: rule.id.clone(),
                    status: RuleStatus::NotMatched,
                    error: None,
                    compile_failed: false,
                });
            }
            Ok(true) => {
                let record = ViolationRecord {
                    tenant_id: self.tenant_id.clone(),
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    trace_id: trace.trace_id.clone(),
                    severity: rule.severity,
                    description: describe_match(rule, &compiled.expr),
                    context: capture_context(trace, compiled.expr.condition()),
                };
                match sink.push(record) {
                    Ok(()) => {
                        result.outcomes.push(RuleOutcome {
                            rule_id: rule.id.clone(),
                            status: RuleStatus::Matched,
                            error: None,
                            compile_failed: false,
                        });
                    }
                    Err(mismatch) => {
                        self.audit.record(SandboxBreach {
                            tenant_id: self.tenant_id.clone(),
                            operation: Some("ViolationSink.push".to_string()),
                            class_name: Some(format!("betrace.rules.{}", rule.id)),
                            stack: rule_stack(&rule.id, "sink"),
                        });
                        result.outcomes.push(RuleOutcome {
                            rule_id: rule.id.clone(),
                            status: RuleStatus::Aborted,
                            error: Some(mismatch.to_string()),
                            compile_failed: false,
                        });
                    }
                }
            }
            Err(abort) => {
                counter!("betrace_rules_aborted").increment(1);
                self.audit.record(SandboxBreach {
                    tenant_id: self.tenant_id.clone(),
                    operation: Some(abort.operation_name().to_string()),
                    class_name: Some(format!("betrace.rules.{}", rule.id)),
                    stack: rule_stack(&rule.id, "walker"),
                });
                result.outcomes.push(RuleOutcome {
                    rule_id: rule.id.clone(),
                    status: RuleStatus::Aborted,
                    error: Some(abort.to_string()),
                    compile_failed: false,
                });
            }
        }

        result.violations.extend(sink.into_records());
    }
}

/// Synthetic evaluation-path frames recorded with a breach.
fn rule_stack(rule_id: &str, phase: &str) -> Vec<String> {
    vec![
        format!("betrace.evaluator.{}", phase),
        format!("betrace.rules.{}", rule_id),
        "betrace.pipeline.worker".to_string(),
    ]
}

fn describe_match(rule: &RuleDefinition, expr: &RuleExpr) -> String {
    match expr {
        RuleExpr::WhenAlways { .. } => format!(
            "rule '{}': condition held but the required pattern was absent",
            rule.name
        ),
        RuleExpr::WhenNever { .. } => format!(
            "rule '{}': condition held and the forbidden pattern was present",
            rule.name
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AST Walker
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether the rule matched (i.e. a violation should be recorded).
pub fn eval_rule_expr(
    expr: &RuleExpr,
    view: &SpanView,
    budget: &EvalBudget,
) -> Result<bool, EvalAbort> {
    match expr {
        RuleExpr::WhenAlways {
            condition,
            requirement,
        } => Ok(eval_predicate(condition, view, budget)?
            && !eval_predicate(requirement, view, budget)?),
        RuleExpr::WhenNever {
            condition,
            forbidden,
        } => {
            Ok(eval_predicate(condition, view, budget)? && eval_predicate(forbidden, view, budget)?)
        }
    }
}

fn eval_predicate(pred: &Predicate, view: &SpanView, budget: &EvalBudget) -> Result<bool, EvalAbort> {
    budget.check_time()?;
    match pred {
        Predicate::And(l, r) => {
            Ok(eval_predicate(l, view, budget)? && eval_predicate(r, view, budget)?)
        }
        Predicate::Or(l, r) => {
            Ok(eval_predicate(l, view, budget)? || eval_predicate(r, view, budget)?)
        }
        Predicate::Not(inner) => Ok(!eval_predicate(inner, view, budget)?),
        Predicate::OpMatch { operation, filters } => {
            let spans = view.spans_named(operation)?;
            Ok(spans
                .iter()
                .any(|span| filters.iter().all(|f| filter_matches(span, f))))
        }
        Predicate::Count {
            operation,
            op,
            value,
        } => {
            let count = view.count_named(operation) as i64;
            Ok(compare_ints(count, *op, *value))
        }
    }
}

fn compare_ints(left: i64, op: CmpOp, right: i64) -> bool {
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Lt => left < right,
        CmpOp::Le => left <= right,
        CmpOp::Gt => left > right,
        CmpOp::Ge => left >= right,
        // `in`, `matches`, `contains` are not defined for counts.
        CmpOp::In | CmpOp::Matches | CmpOp::Contains => false,
    }
}

fn literal_eq(value: &AttrValue, literal: &Literal) -> bool {
    match (value, literal) {
        (AttrValue::Str(a), Literal::Str(b)) => a == b,
        (AttrValue::Bool(a), Literal::Bool(b)) => a == b,
        (v, Literal::Int(b)) => v.as_f64() == Some(*b as f64),
        (v, Literal::Float(b)) => v.as_f64() == Some(*b),
        _ => false,
    }
}

fn literal_as_f64(literal: &Literal) -> Option<f64> {
    match literal {
        Literal::Int(i) => Some(*i as f64),
        Literal::Float(v) => Some(*v),
        _ => None,
    }
}

/// Evaluate one `.where(...)` clause against a span. A missing attribute
/// never matches.
pub fn filter_matches(span: &Span, filter: &Filter) -> bool {
    let Some(value) = span.attribute(&filter.attr) else {
        return false;
    };

    match filter.op {
        CmpOp::Eq => literal_eq(value, &filter.value),
        CmpOp::Ne => !literal_eq(value, &filter.value),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            match (value.as_f64(), literal_as_f64(&filter.value)) {
                (Some(l), Some(r)) => match filter.op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    _ => unreachable!(),
                },
                // Fall back to lexicographic comparison for string pairs.
                _ => match (value.as_str(), &filter.value) {
                    (Some(l), Literal::Str(r)) => match filter.op {
                        CmpOp::Lt => l < r.as_str(),
                        CmpOp::Le => l <= r.as_str(),
                        CmpOp::Gt => l > r.as_str(),
                        CmpOp::Ge => l >= r.as_str(),
                        _ => unreachable!(),
                    },
                    _ => false,
                },
            }
        }
        CmpOp::In => match &filter.value {
            Literal::List(items) => items.iter().any(|item| literal_eq(value, item)),
            _ => false,
        },
        CmpOp::Matches => match (value.as_str(), &filter.pattern) {
            (Some(s), Some(re)) => re.is_match(s),
            _ => false,
        },
        CmpOp::Contains => match value {
            AttrValue::Str(s) => matches!(&filter.value, Literal::Str(needle) if s.contains(needle.as_str())),
            AttrValue::List(items) => items.iter().any(|item| literal_eq(item, &filter.value)),
            _ => false,
        },
    }
}

/// Capture the attributes of the span that triggered the condition, bounded
/// downstream by the sink.
fn capture_context(trace: &Trace, condition: &Predicate) -> BTreeMap<String, AttrValue> {
    fn find<'a>(trace: &'a Trace, pred: &'a Predicate) -> Option<&'a Span> {
        match pred {
            Predicate::OpMatch { operation, filters } => trace
                .spans_named(operation)
                .find(|span| filters.iter().all(|f| filter_matches(span, f))),
            Predicate::And(l, r) | Predicate::Or(l, r) => {
                find(trace, l).or_else(|| find(trace, r))
            }
            Predicate::Not(_) | Predicate::Count { .. } => None,
        }
    }

    let mut context = BTreeMap::new();
    if let Some(span) = find(trace, condition) {
        context = span.attributes.clone();
        context.insert(
            "operation.name".to_string(),
            AttrValue::from(span.operation_name.clone()),
        );
    }
    context
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse_rule;
    use crate::model::{SpanKind, SpanStatus};
    use tokio::sync::mpsc;

    fn make_span(op: &str, attrs: Vec<(&str, AttrValue)>) -> Span {
        Span {
            span_id: "00f067aa0ba902b7".into(),
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".into(),
            parent_span_id: None,
            operation_name: op.into(),
            service_name: "svc".into(),
            start_time_unix_nano: 1_000,
            end_time_unix_nano: 2_000,
            kind: SpanKind::Server,
            status: SpanStatus::Ok,
            attributes: attrs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            resource_attributes: BTreeMap::new(),
            tenant_id: "t1".into(),
        }
    }

    fn make_trace(spans: Vec<Span>) -> Arc<Trace> {
        let mut trace = Trace::new("4bf92f3577b34da6a3ce929d0e0e4736");
        for s in spans {
            trace.push(s);
        }
        Arc::new(trace)
    }

    fn evaluator() -> (SandboxedEvaluator, mpsc::Receiver<Span>) {
        let (tx, rx) = mpsc::channel(64);
        let audit = Arc::new(AuditLogger::new("betrace-processor", tx));
        let cache = Arc::new(ExpressionCache::new(64));
        (
            SandboxedEvaluator::new("t1", RuleConfig::default(), cache, audit),
            rx,
        )
    }

    fn snapshot_with(rules: &[(&str, &str)]) -> (crate::rules::RuleRegistry, Arc<RuleSnapshot>) {
        let registry = crate::rules::RuleRegistry::new("t1");
        for (name, expr) in rules {
            registry.put(name, expr, true);
        }
        let snap = registry.snapshot();
        (registry, snap)
    }

    #[test]
    fn test_when_always_matches_on_missing_requirement() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![make_span(
            "payment.charge",
            vec![("amount", AttrValue::Int(1500))],
        )]);
        let (_reg, snap) = snapshot_with(&[(
            "fraud-check",
            "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
        )]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.outcomes[0].status, RuleStatus::Matched);
        assert_eq!(result.violations[0].tenant_id, "t1");
    }

    #[test]
    fn test_when_always_no_match_when_requirement_present() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![
            make_span("payment.charge", vec![("amount", AttrValue::Int(1500))]),
            make_span("payment.fraud_check", vec![]),
        ]);
        let (_reg, snap) = snapshot_with(&[(
            "fraud-check",
            "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
        )]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert!(result.violations.is_empty());
        assert_eq!(result.outcomes[0].status, RuleStatus::NotMatched);
    }

    #[test]
    fn test_when_never_matches_on_forbidden_presence() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![
            make_span("user.login", vec![]),
            make_span("admin.delete_all", vec![]),
        ]);
        let (_reg, snap) =
            snapshot_with(&[("no-mass-delete", "when { user.login } never { admin.delete_all }")]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn test_condition_below_threshold_does_not_match() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![make_span(
            "payment.charge",
            vec![("amount", AttrValue::Int(500))],
        )]);
        let (_reg, snap) = snapshot_with(&[(
            "fraud-check",
            "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
        )]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert!(result.violations.is_empty());
    }

    #[test]
    fn test_count_predicate() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![
            make_span("db.query", vec![]),
            make_span("db.query", vec![]),
            make_span("db.query", vec![]),
        ]);
        let (_reg, snap) = snapshot_with(&[(
            "n-plus-one",
            "when { count(db.query) > 2 } never { db.query }",
        )]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn test_forbidden_call_routes_to_audit_and_skips_evaluation() {
        let (eval, mut rx) = evaluator();
        let trace = make_trace(vec![make_span("payment.charge", vec![])]);
        let (_reg, snap) =
            snapshot_with(&[("escape", "when { System.exit(0) } always { x }")]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert!(result.violations.is_empty());
        assert_eq!(result.outcomes[0].status, RuleStatus::Aborted);

        let audit_span = rx.try_recv().unwrap();
        assert_eq!(audit_span.operation_name, "sandbox.violation");
        assert_eq!(
            audit_span.attribute("violation.operation").unwrap().as_str(),
            Some("System.exit")
        );
    }

    #[test]
    fn test_parse_error_yields_errored_outcome() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![make_span("a", vec![])]);
        let (_reg, snap) = snapshot_with(&[("broken", "when { { } always { b }")]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        assert_eq!(result.outcomes[0].status, RuleStatus::Errored);
        assert!(result.outcomes[0].compile_failed);
    }

    #[test]
    fn test_cancellation_stops_between_rules() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![make_span("a", vec![])]);
        let (_reg, snap) = snapshot_with(&[
            ("r1", "when { a } always { b }"),
            ("r2", "when { a } always { c }"),
        ]);

        let cancelled = AtomicBool::new(true);
        let result = eval.evaluate(trace, &snap, &cancelled);
        assert!(result.outcomes.is_empty());
    }

    #[test]
    fn test_violation_context_captures_matching_span() {
        let (eval, _rx) = evaluator();
        let trace = make_trace(vec![make_span(
            "payment.charge",
            vec![
                ("amount", AttrValue::Int(1500)),
                ("user.email", AttrValue::from("alice@example.com")),
            ],
        )]);
        let (_reg, snap) = snapshot_with(&[(
            "fraud-check",
            "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
        )]);

        let result = eval.evaluate(trace, &snap, &AtomicBool::new(false));
        let context = &result.violations[0].context;
        assert_eq!(context.get("amount"), Some(&AttrValue::Int(1500)));
        assert_eq!(
            context.get("operation.name").and_then(|v| v.as_str()),
            Some("payment.charge")
        );
    }

    #[test]
    fn test_filter_operators() {
        let span = make_span(
            "api.call",
            vec![
                ("method", AttrValue::from("POST")),
                ("path", AttrValue::from("/admin/users")),
                ("code", AttrValue::Int(503)),
            ],
        );
        let compiled = parse_rule(
            "rule_t",
            r#"when { api.call.where(method in ["POST", "PUT"]).where(path matches "^/admin").where(code >= 500) } never { api.call } "#,
        )
        .unwrap();
        let RuleExpr::WhenNever { condition, .. } = &compiled.expr else {
            panic!();
        };
        let Predicate::OpMatch { filters, .. } = condition else {
            panic!();
        };
        assert!(filters.iter().all(|f| filter_matches(&span, f)));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let span = make_span("api.call", vec![]);
        let compiled = parse_rule(
            "rule_t",
            r#"when { api.call.where(method == "POST") } never { api.call }"#,
        )
        .unwrap();
        let RuleExpr::WhenNever { condition, .. } = &compiled.expr else {
            panic!();
        };
        let Predicate::OpMatch { filters, .. } = condition else {
            panic!();
        };
        assert!(!filter_matches(&span, &filters[0]));
    }
}
