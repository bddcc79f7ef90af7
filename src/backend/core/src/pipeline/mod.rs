//! Pipeline orchestration.
//!
//! Wires receiver -> assembler -> evaluator -> redactor -> emitter -> signer
//! -> exporter. Original application spans are forwarded unchanged in the
//! same export stream; the processor is strictly additive on the main path.
//! Sandbox breaches bypass the normal output and reach the exporter through
//! the audit channel.

pub mod convert;
pub mod exporter;
pub mod receiver;
pub mod worker_pool;

pub use exporter::{CollectingExporter, ExportError, OtlpExporter, SpanExporter};
pub use receiver::{http_receiver_router, run_grpc_receiver, OtlpGrpcReceiver, SpanIngest};
pub use worker_pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::TraceAssembler;
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::dsl::ExpressionCache;
use crate::emitter::{EvidenceEvent, EvidenceOutcome, SpanEmitter};
use crate::evaluator::{RuleStatus, SandboxedEvaluator};
use crate::model::{Span, Trace};
use crate::redaction::Redactor;
use crate::rules::RuleRegistry;
use crate::signer::{ComplianceSigner, KeySource, StaticKeySource};

/// Service identity attached to processor-originated spans.
pub const SERVICE_NAME: &str = "betrace-processor";

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Handles to the pipeline's background tasks, in drain order.
pub struct PipelineHandle {
    token: CancellationToken,
    batcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    export_task: JoinHandle<()>,
}

struct PipelineInner {
    config: Config,
    registry: Arc<RuleRegistry>,
    cache: Arc<ExpressionCache>,
    evaluator: SandboxedEvaluator,
    assembler: Arc<TraceAssembler>,
    redactor: Redactor,
    emitter: SpanEmitter,
    signer: Arc<ComplianceSigner>,
    audit: Arc<AuditLogger>,
    exporter: Arc<dyn SpanExporter>,
    pool: Arc<WorkerPool>,
    cancel: AtomicBool,

    ingest_tx: Mutex<Option<mpsc::Sender<Span>>>,
    ingest_rx: Mutex<Option<mpsc::Receiver<Span>>>,
    export_tx: Mutex<Option<mpsc::Sender<Span>>>,
    export_rx: Mutex<Option<mpsc::Receiver<Span>>>,
    audit_rx: Mutex<Option<mpsc::Receiver<Span>>>,
}

/// The assembled evaluation pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        registry: Arc<RuleRegistry>,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        let key_source: Arc<dyn KeySource> = Arc::new(StaticKeySource::new(
            config
                .signer
                .master_key_hex
                .as_deref()
                .and_then(|h| hex::decode(h).ok())
                .unwrap_or_else(|| SERVICE_NAME.as_bytes().to_vec()),
        ));
        Self::with_key_source(config, registry, exporter, key_source)
    }

    pub fn with_key_source(
        config: Config,
        registry: Arc<RuleRegistry>,
        exporter: Arc<dyn SpanExporter>,
        key_source: Arc<dyn KeySource>,
    ) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel(config.batch.size * 4);
        let (export_tx, export_rx) = mpsc::channel(config.batch.size * 8);
        let (audit_tx, audit_rx) = mpsc::channel(256);

        let cache = Arc::new(ExpressionCache::new(config.rule.cache_capacity));
        {
            let cache = cache.clone();
            registry.on_invalidate(Arc::new(move |rule_id| cache.invalidate(rule_id)));
        }

        let audit = Arc::new(AuditLogger::new(SERVICE_NAME, audit_tx));
        let evaluator = SandboxedEvaluator::new(
            registry.tenant_id(),
            config.rule.clone(),
            cache.clone(),
            audit.clone(),
        );
        let assembler = Arc::new(TraceAssembler::new(config.trace.clone()));
        let redactor = Redactor::new(&config.redaction);
        let emitter = SpanEmitter::new(SERVICE_NAME);
        let signer = Arc::new(ComplianceSigner::new(key_source));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            max_workers: config.batch.workers,
            ..Default::default()
        }));

        Self {
            inner: Arc::new(PipelineInner {
                config,
                registry,
                cache,
                evaluator,
                assembler,
                redactor,
                emitter,
                signer,
                audit,
                exporter,
                pool,
                cancel: AtomicBool::new(false),
                ingest_tx: Mutex::new(Some(ingest_tx)),
                ingest_rx: Mutex::new(Some(ingest_rx)),
                export_tx: Mutex::new(Some(export_tx)),
                export_rx: Mutex::new(Some(export_rx)),
                audit_rx: Mutex::new(Some(audit_rx)),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Sender feeding the pipeline; receivers hold clones of this.
    pub fn ingest_sender(&self) -> mpsc::Sender<Span> {
        self.inner
            .ingest_tx
            .lock()
            .clone()
            .expect("pipeline already shut down")
    }

    pub fn registry(&self) -> Arc<RuleRegistry> {
        self.inner.registry.clone()
    }

    pub fn assembler(&self) -> Arc<TraceAssembler> {
        self.inner.assembler.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.inner.pool.clone()
    }

    pub fn cache(&self) -> Arc<ExpressionCache> {
        self.inner.cache.clone()
    }

    pub fn audit(&self) -> Arc<AuditLogger> {
        self.inner.audit.clone()
    }

    pub fn signer(&self) -> Arc<ComplianceSigner> {
        self.inner.signer.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the batcher, sweeper, and export tasks.
    pub fn start(&self) -> PipelineHandle {
        let token = CancellationToken::new();

        let batcher = self.spawn_batcher();
        let sweeper = self.spawn_sweeper(token.clone());
        let export_task = self.spawn_export_task();

        info!(
            workers = self.inner.config.batch.workers,
            batch_size = self.inner.config.batch.size,
            "pipeline started"
        );

        PipelineHandle {
            token,
            batcher,
            sweeper,
            export_task,
        }
    }

    /// Ingest batcher: accumulates spans up to batch size/timeout, forwards
    /// originals unchanged, and feeds the assembler. Exits when every ingest
    /// sender is gone.
    fn spawn_batcher(&self) -> JoinHandle<()> {
        let pipeline = self.clone();
        let mut rx = pipeline
            .inner
            .ingest_rx
            .lock()
            .take()
            .expect("pipeline started twice");

        tokio::spawn(async move {
            let batch_size = pipeline.inner.config.batch.size;
            let batch_timeout = pipeline.inner.config.batch.timeout;
            let mut batch: Vec<Span> = Vec::with_capacity(batch_size);

            loop {
                match tokio::time::timeout(batch_timeout, rx.recv()).await {
                    Ok(Some(span)) => {
                        batch.push(span);
                        if batch.len() >= batch_size {
                            pipeline.flush_ingest_batch(&mut batch).await;
                        }
                    }
                    Ok(None) => {
                        pipeline.flush_ingest_batch(&mut batch).await;
                        debug!("ingest channel closed; batcher exiting");
                        break;
                    }
                    Err(_elapsed) => {
                        pipeline.flush_ingest_batch(&mut batch).await;
                    }
                }
            }
        })
    }

    async fn flush_ingest_batch(&self, batch: &mut Vec<Span>) {
        if batch.is_empty() {
            return;
        }
        let export_tx = self.inner.export_tx.lock().clone();
        for span in batch.drain(..) {
            // Forward the original untouched; the assembler gets its own copy.
            if let Some(tx) = &export_tx {
                let _ = tx.send(span.clone()).await;
            }
            self.inner.assembler.ingest(span);
        }
    }

    /// Sweeper: periodically releases completed traces and dispatches each
    /// to a pooled worker.
    fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let tick = (pipeline.inner.config.trace.quiet_interval / 4)
                .clamp(Duration::from_millis(10), Duration::from_millis(250));
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        for trace in pipeline.inner.assembler.sweep() {
                            pipeline.dispatch(trace).await;
                        }
                    }
                }
            }
            debug!("sweeper exiting");
        })
    }

    async fn dispatch(&self, trace: Trace) {
        let permit = match self.inner.pool.acquire().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, trace_id = %trace.trace_id, "no worker available; trace dropped");
                counter!("betrace_traces_dropped").increment(1);
                return;
            }
        };

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.process_trace(trace).await;
            permit.mark_success();
        });
    }

    /// One worker's end-to-end handling of a completed trace.
    async fn process_trace(&self, trace: Trace) {
        let started = Instant::now();
        let trace = Arc::new(trace);
        let snapshot = self.inner.registry.snapshot();

        let result = self
            .inner
            .evaluator
            .evaluate(trace.clone(), &snapshot, &self.inner.cancel);

        for outcome in &result.outcomes {
            if outcome.compile_failed {
                if let Some(error) = &outcome.error {
                    self.inner
                        .registry
                        .mark_inert(&outcome.rule_id, error.clone());
                }
            }
            if outcome.status == RuleStatus::Errored {
                counter!("betrace_rules_errored").increment(1);
            }
        }

        let export_tx = self.inner.export_tx.lock().clone();
        let Some(export_tx) = export_tx else {
            return;
        };

        for record in result.violations {
            let context = match self.inner.redactor.redact_context(record.context.clone()) {
                Ok(context) => context,
                Err(e) => {
                    // Fatal for this span only; the batch proceeds.
                    warn!(rule_id = %record.rule_id, error = %e, "violation span suppressed");
                    continue;
                }
            };

            let violation_span = self.inner.emitter.violation_span(&record, context);
            match self.inner.redactor.check_span(&violation_span) {
                Ok(()) => {
                    counter!("betrace_violations_emitted").increment(1);
                    let _ = export_tx.send(violation_span).await;
                }
                Err(e) => {
                    warn!(rule_id = %record.rule_id, error = %e, "violation span suppressed");
                    continue;
                }
            }

            // Evidence that redaction ran for this violation's context.
            let event = EvidenceEvent::pii_redaction(
                &record.tenant_id,
                &record.trace_id,
                EvidenceOutcome::Success,
            );
            let mut evidence_span = self.inner.emitter.evidence_span(&event);
            self.inner.signer.sign_span(&mut evidence_span);
            match self.inner.redactor.check_span(&evidence_span) {
                Ok(()) => {
                    let _ = export_tx.send(evidence_span).await;
                }
                Err(e) => {
                    warn!(trace_id = %record.trace_id, error = %e, "evidence span suppressed");
                }
            }
        }

        let elapsed = started.elapsed();
        histogram!("betrace_trace_eval_seconds").record(elapsed.as_secs_f64());
        if elapsed > self.inner.config.batch.latency_budget {
            counter!("betrace_latency_budget_exceeded").increment(1);
            debug!(
                trace_id = %trace.trace_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "trace evaluation exceeded latency budget"
            );
        }
    }

    /// Export task: merges the main output stream and the audit stream,
    /// batching towards the exporter.
    fn spawn_export_task(&self) -> JoinHandle<()> {
        let pipeline = self.clone();
        let mut export_rx = pipeline
            .inner
            .export_rx
            .lock()
            .take()
            .expect("pipeline started twice");
        let mut audit_rx = pipeline
            .inner
            .audit_rx
            .lock()
            .take()
            .expect("pipeline started twice");

        tokio::spawn(async move {
            let batch_size = pipeline.inner.config.batch.size;
            let batch_timeout = pipeline.inner.config.batch.timeout;
            let mut batch: Vec<Span> = Vec::with_capacity(batch_size);
            let mut main_open = true;
            let mut audit_open = true;

            loop {
                if !main_open && !audit_open {
                    pipeline.flush_export(&mut batch).await;
                    break;
                }

                tokio::select! {
                    received = export_rx.recv(), if main_open => match received {
                        Some(span) => {
                            batch.push(span);
                            if batch.len() >= batch_size {
                                pipeline.flush_export(&mut batch).await;
                            }
                        }
                        None => main_open = false,
                    },
                    received = audit_rx.recv(), if audit_open => match received {
                        Some(span) => {
                            batch.push(span);
                            if batch.len() >= batch_size {
                                pipeline.flush_export(&mut batch).await;
                            }
                        }
                        None => audit_open = false,
                    },
                    _ = tokio::time::sleep(batch_timeout) => {
                        pipeline.flush_export(&mut batch).await;
                    }
                }
            }
            debug!("export task exiting");
        })
    }

    async fn flush_export(&self, batch: &mut Vec<Span>) {
        if batch.is_empty() {
            return;
        }
        let spans = std::mem::take(batch);
        if let Err(e) = self.inner.exporter.export(spans).await {
            // Retries and drop counters live inside the exporter.
            warn!(error = %e, "export batch failed");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Graceful drain, in order: stop accepting spans, let the batcher flush,
    /// stop the sweeper, evaluate everything still resident (truncated where
    /// inside its quiet interval), then flush the exporter. Returns only
    /// after the exporter acknowledges drain.
    ///
    /// The caller must stop the receivers first; their ingest-sender clones
    /// keep the batcher alive until dropped.
    pub async fn shutdown(&self, handle: PipelineHandle) {
        info!("pipeline shutdown: draining");

        // Stop accepting spans; once receiver-held clones drop too, the
        // batcher flushes its partial batch and exits.
        self.inner.ingest_tx.lock().take();
        let _ = handle.batcher.await;

        // Stop the sweeper; in-flight dispatches finish on their own permits.
        handle.token.cancel();
        let _ = handle.sweeper.await;

        // Drain the assembler and evaluate what remains.
        for trace in self.inner.assembler.flush_all() {
            self.process_trace(trace).await;
        }

        // Closing the export side lets the export task flush and exit.
        self.inner.export_tx.lock().take();
        let _ = handle.export_task.await;

        self.inner.exporter.shutdown().await;
        info!("pipeline shutdown complete");
    }

    /// Hard abort: request cooperative cancellation of outstanding rule
    /// evaluations. Checked between rules.
    pub fn abort_evaluations(&self) {
        self.inner.cancel.store(true, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceConfig;
    use crate::model::{SpanKind, SpanStatus};
    use std::collections::BTreeMap;

    fn test_config() -> Config {
        let mut config = Config {
            trace: TraceConfig {
                quiet_interval: Duration::from_millis(50),
                max_age: Duration::from_secs(10),
                max_resident_spans: 10_000,
            },
            ..Default::default()
        };
        config.batch.timeout = Duration::from_millis(25);
        config
    }

    fn span(trace_n: u8, op: &str, attrs: Vec<(&str, crate::model::AttrValue)>) -> Span {
        Span {
            span_id: crate::model::span::fresh_span_id(),
            trace_id: format!("{:032x}", trace_n as u64 + 10),
            parent_span_id: None,
            operation_name: op.into(),
            service_name: "payments".into(),
            start_time_unix_nano: 1_000,
            end_time_unix_nano: 2_000,
            kind: SpanKind::Server,
            status: SpanStatus::Ok,
            attributes: attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            resource_attributes: BTreeMap::new(),
            tenant_id: "default".into(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_forwards_originals_unchanged() {
        let exporter = Arc::new(CollectingExporter::new());
        let registry = Arc::new(RuleRegistry::new("default"));
        let pipeline = Pipeline::new(test_config(), registry, exporter.clone());
        let handle = pipeline.start();

        let original = span(1, "payment.charge", vec![]);
        pipeline
            .ingest_sender()
            .send(original.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        pipeline.shutdown(handle).await;

        let exported = exporter.spans();
        let forwarded = exported
            .iter()
            .find(|s| s.span_id == original.span_id)
            .expect("original span forwarded");
        assert_eq!(forwarded, &original);
    }

    #[tokio::test]
    async fn test_pipeline_emits_violation_with_same_trace_id() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let exporter = Arc::new(CollectingExporter::new());
        let registry = Arc::new(RuleRegistry::new("default"));
        registry.put(
            "fraud-check",
            "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
            true,
        );
        let pipeline = Pipeline::new(test_config(), registry, exporter.clone());
        let handle = pipeline.start();

        let original = span(
            2,
            "payment.charge",
            vec![("amount", crate::model::AttrValue::Int(1500))],
        );
        let trace_id = original.trace_id.clone();
        pipeline.ingest_sender().send(original).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        pipeline.shutdown(handle).await;

        let exported = exporter.spans();
        let violation = exported
            .iter()
            .find(|s| s.operation_name == crate::emitter::VIOLATION_SPAN_NAME)
            .expect("violation span emitted");
        assert_eq!(violation.trace_id, trace_id);
    }
}
