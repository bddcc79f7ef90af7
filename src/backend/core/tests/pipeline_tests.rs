//! End-to-end pipeline tests: ingestion through export.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use betrace_core::config::{Config, TraceConfig};
use betrace_core::emitter::{EVIDENCE_SPAN_NAME, VIOLATION_SPAN_NAME};
use betrace_core::model::{AttrValue, Span, SpanKind, SpanStatus};
use betrace_core::pipeline::{CollectingExporter, Pipeline};
use betrace_core::redaction::{RedactionError, Redactor};
use betrace_core::rules::RuleRegistry;
use betrace_core::signer::SIGNING_FAILED;

fn test_config(quiet_ms: u64) -> Config {
    let mut config = Config {
        trace: TraceConfig {
            quiet_interval: Duration::from_millis(quiet_ms),
            max_age: Duration::from_secs(30),
            max_resident_spans: 100_000,
        },
        ..Default::default()
    };
    config.batch.timeout = Duration::from_millis(20);
    config
}

fn payment_span(trace_n: u64, attrs: Vec<(&str, AttrValue)>) -> Span {
    Span {
        span_id: betrace_core::model::span::fresh_span_id(),
        trace_id: format!("{:032x}", trace_n),
        parent_span_id: None,
        operation_name: "payment.charge".into(),
        service_name: "payments".into(),
        start_time_unix_nano: 1_700_000_000_000_000_000,
        end_time_unix_nano: 1_700_000_000_050_000_000,
        kind: SpanKind::Server,
        status: SpanStatus::Ok,
        attributes: attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        resource_attributes: BTreeMap::from([(
            "service.name".to_string(),
            "payments".to_string(),
        )]),
        tenant_id: "default".into(),
    }
}

const FRAUD_RULE: &str =
    "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }";

struct Harness {
    pipeline: Pipeline,
    exporter: Arc<CollectingExporter>,
    handle: Option<betrace_core::pipeline::PipelineHandle>,
    rule_id: Option<String>,
}

async fn start_with_rule(quiet_ms: u64, rule: Option<&str>) -> Harness {
    let exporter = Arc::new(CollectingExporter::new());
    let registry = Arc::new(RuleRegistry::new("default"));
    let rule_id = rule.map(|expr| registry.put("fraud-check", expr, true));
    let pipeline = Pipeline::new(test_config(quiet_ms), registry, exporter.clone());
    let handle = pipeline.start();
    Harness {
        pipeline,
        exporter,
        handle: Some(handle),
        rule_id,
    }
}

impl Harness {
    async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pipeline.shutdown(handle).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// S1: basic violation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_basic_violation_emits_exactly_one_span() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let original = payment_span(0x51, vec![("amount", AttrValue::Int(1500))]);
    let trace_id = original.trace_id.clone();

    harness
        .pipeline
        .ingest_sender()
        .send(original)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    let violations: Vec<Span> = harness
        .exporter
        .spans()
        .into_iter()
        .filter(|s| s.operation_name == VIOLATION_SPAN_NAME)
        .collect();

    assert_eq!(violations.len(), 1, "expected exactly one violation span");
    let violation = &violations[0];
    assert_eq!(violation.trace_id, trace_id);
    assert_eq!(
        violation
            .attribute("betrace.violation.rule_id")
            .and_then(AttrValue::as_str),
        harness.rule_id.as_deref()
    );
}

#[tokio::test]
async fn no_violation_when_fraud_check_present() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let charge = payment_span(0x52, vec![("amount", AttrValue::Int(1500))]);
    let mut fraud_check = payment_span(0x52, vec![]);
    fraud_check.operation_name = "payment.fraud_check".into();
    fraud_check.parent_span_id = Some(charge.span_id.clone());

    let tx = harness.pipeline.ingest_sender();
    tx.send(charge).await.unwrap();
    tx.send(fraud_check).await.unwrap();
    drop(tx);

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    assert!(
        !harness
            .exporter
            .spans()
            .iter()
            .any(|s| s.operation_name == VIOLATION_SPAN_NAME),
        "fraud check present, no violation expected"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// S2: PII redaction in the emitted context
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_pii_redaction_in_violation_context() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let original = payment_span(
        0x53,
        vec![
            ("amount", AttrValue::Int(1500)),
            ("user.email", AttrValue::from("alice@example.com")),
            ("user.ssn", AttrValue::from("123-45-6789")),
            ("payment.card_number", AttrValue::from("4532123456789010")),
        ],
    );

    harness
        .pipeline
        .ingest_sender()
        .send(original)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    let spans = harness.exporter.spans();
    let violation = spans
        .iter()
        .find(|s| s.operation_name == VIOLATION_SPAN_NAME)
        .expect("violation span emitted");

    let email = violation
        .attribute("user.email")
        .and_then(AttrValue::as_str)
        .expect("email present in context");
    assert_eq!(email.len(), 64);
    assert!(email.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_ne!(email, "alice@example.com");

    assert_eq!(
        violation.attribute("user.ssn").and_then(AttrValue::as_str),
        Some("<redacted>")
    );

    let card = violation
        .attribute("payment.card_number")
        .and_then(AttrValue::as_str)
        .expect("card present in context");
    assert_eq!(card.len(), 16);
    assert!(card.ends_with("9010"));
    assert!(card.contains("****"));
}

// ─────────────────────────────────────────────────────────────────────────────
// S3: whitelist enforcement
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn s3_unwhitelisted_attribute_is_fatal_for_that_span() {
    let redactor = Redactor::new(&Default::default());
    let mut span = payment_span(0x54, vec![]);
    span.attributes
        .insert("foo_bar".to_string(), AttrValue::from("x"));

    let err = redactor.check_span(&span).unwrap_err();
    assert_eq!(
        err,
        RedactionError::UnsafeAttribute {
            key: "foo_bar".into()
        }
    );
}

#[tokio::test]
async fn s3_rest_of_batch_proceeds_after_suppression() {
    // Two traces: one whose violation context carries an unwhitelisted key,
    // one clean. The clean trace's violation must still export.
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;

    let poisoned = payment_span(
        0x55,
        vec![
            ("amount", AttrValue::Int(1500)),
            ("secret_internal_key", AttrValue::from("x")),
        ],
    );
    let clean = payment_span(0x56, vec![("amount", AttrValue::Int(2000))]);
    let clean_trace = clean.trace_id.clone();

    let tx = harness.pipeline.ingest_sender();
    tx.send(poisoned).await.unwrap();
    tx.send(clean).await.unwrap();
    drop(tx);

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    let violations: Vec<Span> = harness
        .exporter
        .spans()
        .into_iter()
        .filter(|s| s.operation_name == VIOLATION_SPAN_NAME)
        .collect();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].trace_id, clean_trace);
}

// ─────────────────────────────────────────────────────────────────────────────
// S7: completion on quiet interval
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s7_no_evaluation_before_quiet_interval() {
    let mut harness = start_with_rule(400, Some(FRAUD_RULE)).await;
    let tx = harness.pipeline.ingest_sender();

    // Spans trickle in over ~300 ms, then the trace goes quiet.
    for i in 0..3u64 {
        let mut span = payment_span(0x57, vec![("amount", AttrValue::Int(1500))]);
        if i > 0 {
            span.operation_name = format!("child.op{}", i);
            span.parent_span_id = Some("00f067aa0ba902b7".into());
        }
        tx.send(span).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    drop(tx);

    // Quiet interval (400 ms) has not elapsed since the last span yet.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        !harness
            .exporter
            .spans()
            .iter()
            .any(|s| s.operation_name == VIOLATION_SPAN_NAME),
        "no evaluation may occur before the quiet interval elapses"
    );

    // Past quiet interval + epsilon: exactly one evaluation.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let violations = harness
        .exporter
        .spans()
        .iter()
        .filter(|s| s.operation_name == VIOLATION_SPAN_NAME)
        .count();
    assert_eq!(violations, 1);

    harness.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Universal invariants
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn forwarded_originals_are_field_identical() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let original = payment_span(
        0x58,
        vec![
            ("amount", AttrValue::Int(1500)),
            ("user.email", AttrValue::from("alice@example.com")),
        ],
    );

    harness
        .pipeline
        .ingest_sender()
        .send(original.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    let spans = harness.exporter.spans();
    let forwarded = spans
        .iter()
        .find(|s| s.span_id == original.span_id)
        .expect("original forwarded");
    // Field-by-field equality, raw PII included: the processor never
    // mutates application spans.
    assert_eq!(forwarded, &original);
}

#[tokio::test]
async fn emitted_spans_preserve_trace_id_and_pass_whitelist() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let original = payment_span(0x59, vec![("amount", AttrValue::Int(1500))]);
    let trace_id = original.trace_id.clone();

    harness
        .pipeline
        .ingest_sender()
        .send(original)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.shutdown().await;

    let redactor = Redactor::new(&Default::default());
    for span in harness
        .exporter
        .spans()
        .iter()
        .filter(|s| s.operation_name == VIOLATION_SPAN_NAME || s.operation_name == EVIDENCE_SPAN_NAME)
    {
        assert_eq!(span.trace_id, trace_id, "trace-id preservation");
        assert!(
            redactor.check_span(span).is_ok(),
            "whitelist closure on {}",
            span.operation_name
        );
    }
}

#[tokio::test]
async fn evidence_spans_are_signed_and_verifiable() {
    let mut harness = start_with_rule(80, Some(FRAUD_RULE)).await;
    let original = payment_span(0x5a, vec![("amount", AttrValue::Int(1500))]);

    harness
        .pipeline
        .ingest_sender()
        .send(original)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let signer = harness.pipeline.signer();
    harness.shutdown().await;

    let spans = harness.exporter.spans();
    let evidence = spans
        .iter()
        .find(|s| s.operation_name == EVIDENCE_SPAN_NAME)
        .expect("evidence span emitted");

    let signature = evidence
        .attribute("betrace.compliance.signature")
        .and_then(AttrValue::as_str)
        .expect("signature attribute present");
    assert_ne!(signature, SIGNING_FAILED);
    assert!(signer.verify_span(evidence), "signature verifiability");
}

#[tokio::test]
async fn inert_rule_never_blocks_other_rules() {
    let exporter = Arc::new(CollectingExporter::new());
    let registry = Arc::new(RuleRegistry::new("default"));
    registry.put("broken", "when { (((( } always { b }", true);
    let good_id = registry.put("fraud-check", FRAUD_RULE, true);
    let pipeline = Pipeline::new(test_config(80), registry.clone(), exporter.clone());
    let handle = pipeline.start();

    pipeline
        .ingest_sender()
        .send(payment_span(0x5b, vec![("amount", AttrValue::Int(1500))]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.shutdown(handle).await;

    // The good rule still fired.
    assert!(exporter
        .spans()
        .iter()
        .any(|s| s.attribute("betrace.violation.rule_id").and_then(AttrValue::as_str)
            == Some(good_id.as_str())));

    // The broken rule is inert with its error recorded.
    let broken = registry
        .snapshot()
        .all_rules()
        .find(|r| r.name == "broken")
        .cloned()
        .expect("broken rule still listed");
    assert!(broken.compile_error.is_some());
}
