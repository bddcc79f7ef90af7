//! Downstream OTLP export with bounded retry.
//!
//! The exporter is a trait so the pipeline can be exercised in tests with a
//! collecting implementation; production uses the OTLP/gRPC client against
//! the configured trace store endpoint.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_client::TraceServiceClient, ExportTraceServiceRequest,
};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::config::ExportConfig;
use crate::model::Span;

use super::convert::spans_to_resource_spans;

// ═══════════════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("export retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Destination for every span leaving the pipeline: forwarded originals,
/// violation spans, evidence spans, and audit spans alike.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError>;

    /// Flush and release resources. Called once during shutdown drain.
    async fn shutdown(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// OTLP Exporter
// ═══════════════════════════════════════════════════════════════════════════════

/// OTLP/gRPC exporter with exponential backoff and a bounded retry budget.
/// A batch that exhausts its budget is dropped and counted, never requeued.
pub struct OtlpExporter {
    config: ExportConfig,
    client: Mutex<Option<TraceServiceClient<Channel>>>,
}

impl OtlpExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    async fn connected_client(&self) -> Result<TraceServiceClient<Channel>, ExportError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let endpoint = Channel::from_shared(self.config.endpoint.clone())
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        let client = TraceServiceClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn try_export(&self, spans: &[Span]) -> Result<(), ExportError> {
        let request = ExportTraceServiceRequest {
            resource_spans: spans_to_resource_spans(spans.to_vec()),
        };
        let mut client = self.connected_client().await?;
        client.export(request).await.map_err(|status| {
            ExportError::Transport(format!("{}: {}", status.code(), status.message()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl SpanExporter for OtlpExporter {
    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        if spans.is_empty() {
            return Ok(());
        }

        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let cap = Duration::from_millis(self.config.retry_backoff_cap_ms);
        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.try_export(&spans).await {
                Ok(()) => {
                    debug!(spans = spans.len(), attempt, "batch exported");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %last_error, "export attempt failed");
                    // A failed channel may be stale; rebuild on next attempt.
                    *self.client.lock().await = None;
                    if attempt < max_attempts {
                        counter!("betrace_export_retries").increment(1);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(cap);
                    }
                }
            }
        }

        let dropped_bytes: u64 = spans.iter().map(Span::approx_size).sum();
        counter!("betrace_export_dropped_batches").increment(1);
        counter!("betrace_export_dropped_bytes").increment(dropped_bytes);
        warn!(
            spans = spans.len(),
            dropped_bytes, "batch dropped after exhausting retry budget"
        );
        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collecting Exporter (tests & local runs)
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulates exported spans in memory. Used by the test suites and by the
/// pipeline's dry-run mode.
#[derive(Default)]
pub struct CollectingExporter {
    spans: parking_lot::Mutex<Vec<Span>>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SpanExporter for CollectingExporter {
    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        self.spans.lock().extend(spans);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collecting_exporter_accumulates() {
        let exporter = CollectingExporter::new();
        let span = crate::model::span::tests_support::minimal_span();
        exporter.export(vec![span.clone()]).await.unwrap();
        exporter.export(vec![span]).await.unwrap();
        assert_eq!(exporter.len(), 2);
    }

    #[tokio::test]
    async fn test_otlp_exporter_gives_up_after_retry_budget() {
        // Nothing listens on this port; every attempt fails fast.
        let exporter = OtlpExporter::new(ExportConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            tls_insecure: false,
            retry_backoff_ms: 1,
            retry_backoff_cap_ms: 2,
            retry_max_attempts: 2,
        });

        let span = crate::model::span::tests_support::minimal_span();
        let err = exporter.export(vec![span]).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let exporter = OtlpExporter::new(ExportConfig::default());
        assert!(exporter.export(Vec::new()).await.is_ok());
    }
}
