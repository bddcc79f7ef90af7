//! Observability: structured logging, self-tracing, and metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack. Returns the Prometheus handle for
/// the `/metrics` endpoint.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    // Set up OpenTelemetry self-tracing if an endpoint is provided.
    if let Some(endpoint) = config.otlp_endpoint.as_deref() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config().with_resource(opentelemetry_sdk::Resource::new(
                    vec![opentelemetry::KeyValue::new(
                        "service.name",
                        service_name.to_string(),
                    )],
                )),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        if config.json_logging {
            tracing_subscriber::registry()
                .with(filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(telemetry_layer)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    } else if config.json_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(prometheus)
}

/// Shutdown OpenTelemetry, flushing remaining self-tracing spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Register descriptions for every counter the pipeline emits.
pub fn register_metrics() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(
        "betrace_spans_dropped_malformed",
        "Spans dropped at the receiver for failing validation"
    );
    describe_counter!(
        "betrace_rules_inert",
        "Rules marked inert after a parse/compile error"
    );
    describe_counter!(
        "betrace_rules_errored",
        "Rule evaluations that ended in an expression error"
    );
    describe_counter!(
        "betrace_rules_aborted",
        "Rule evaluations aborted for exceeding a budget"
    );
    describe_counter!(
        "betrace_sandbox_violations",
        "Sandbox escape attempts recorded by the audit trail"
    );
    describe_counter!(
        "betrace_unsafe_attribute",
        "Spans suppressed for carrying a non-whitelisted attribute key"
    );
    describe_counter!(
        "betrace_pii_leakage",
        "Spans suppressed for carrying PII that survived redaction"
    );
    describe_counter!(
        "betrace_signing_failures",
        "Evidence spans emitted with the signing_failed marker"
    );
    describe_counter!(
        "betrace_violations_emitted",
        "Violation spans emitted to the trace store"
    );
    describe_counter!(
        "betrace_export_retries",
        "Export attempts retried after a transport failure"
    );
    describe_counter!(
        "betrace_export_dropped_batches",
        "Batches dropped after exhausting the export retry budget"
    );
    describe_counter!(
        "betrace_export_dropped_bytes",
        "Approximate bytes dropped with failed export batches"
    );
    describe_counter!(
        "betrace_traces_evicted",
        "Traces evicted by the resident span cap"
    );
    describe_counter!(
        "betrace_traces_truncated",
        "Traces evaluated as-is after hitting max in-memory age"
    );
    describe_counter!(
        "betrace_traces_dropped",
        "Completed traces dropped for lack of a worker"
    );
    describe_counter!(
        "betrace_latency_budget_exceeded",
        "Traces whose evaluation exceeded the latency budget"
    );
    describe_counter!(
        "betrace_sanitizer_blocked",
        "Control-plane requests rejected by the input screen"
    );
    describe_counter!(
        "betrace_errors_total",
        "Errors constructed, labeled by code and category"
    );

    describe_histogram!(
        "betrace_rule_eval_seconds",
        "Per-rule evaluation duration in seconds"
    );
    describe_histogram!(
        "betrace_trace_eval_seconds",
        "End-to-end per-trace evaluation duration in seconds"
    );
}
