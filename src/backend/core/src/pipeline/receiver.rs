//! OTLP receivers: gRPC (:4317) and HTTP/protobuf (:4318).
//!
//! Both surfaces share one flattening path; a span that fails validation is
//! dropped with a counter and never aborts the batch.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use metrics::counter;
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::model::Span;

use super::convert::flatten_resource_spans;

// ═══════════════════════════════════════════════════════════════════════════════
// Shared ingest path
// ═══════════════════════════════════════════════════════════════════════════════

/// Hands validated spans to the pipeline. Cloneable; both receivers hold one.
#[derive(Clone)]
pub struct SpanIngest {
    tenant_id: String,
    tx: mpsc::Sender<Span>,
}

impl SpanIngest {
    pub fn new(tenant_id: impl Into<String>, tx: mpsc::Sender<Span>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tx,
        }
    }

    /// Flatten, validate, and enqueue a whole OTLP export request.
    pub async fn accept(&self, request: ExportTraceServiceRequest) {
        let mut accepted = 0usize;
        let mut dropped = 0usize;

        for resource_spans in request.resource_spans {
            for span in flatten_resource_spans(resource_spans, &self.tenant_id) {
                if let Err(e) = span.validate() {
                    dropped += 1;
                    counter!("betrace_spans_dropped_malformed").increment(1);
                    debug!(error = %e, "dropping malformed span");
                    continue;
                }
                if self.tx.send(span).await.is_err() {
                    warn!("pipeline ingest channel closed; dropping remainder of batch");
                    return;
                }
                accepted += 1;
            }
        }

        debug!(accepted, dropped, "receiver batch processed");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// gRPC receiver
// ═══════════════════════════════════════════════════════════════════════════════

pub struct OtlpGrpcReceiver {
    ingest: SpanIngest,
}

impl OtlpGrpcReceiver {
    pub fn new(ingest: SpanIngest) -> Self {
        Self { ingest }
    }

    pub fn into_service(self) -> TraceServiceServer<Self> {
        TraceServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.ingest.accept(request.into_inner()).await;
        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: None,
        }))
    }
}

/// Serve the OTLP gRPC receiver until the shutdown future resolves.
pub async fn run_grpc_receiver(
    ingest: SpanIngest,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(address = %addr, "OTLP gRPC receiver listening");
    tonic::transport::Server::builder()
        .add_service(OtlpGrpcReceiver::new(ingest).into_service())
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP/protobuf receiver
// ═══════════════════════════════════════════════════════════════════════════════

/// Router exposing `POST /v1/traces` with `application/x-protobuf` bodies.
pub fn http_receiver_router(ingest: SpanIngest) -> Router {
    Router::new()
        .route("/v1/traces", post(accept_http_traces))
        .with_state(Arc::new(ingest))
}

async fn accept_http_traces(
    State(ingest): State<Arc<SpanIngest>>,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = [(header::CONTENT_TYPE, "application/x-protobuf")];

    let request = match ExportTraceServiceRequest::decode(body) {
        Ok(req) => req,
        Err(e) => {
            counter!("betrace_spans_dropped_malformed").increment(1);
            warn!(error = %e, "rejecting undecodable OTLP/HTTP payload");
            return (StatusCode::BAD_REQUEST, content_type, Vec::new());
        }
    };

    ingest.accept(request).await;

    let response = ExportTraceServiceResponse {
        partial_success: None,
    };
    (StatusCode::OK, content_type, response.encode_to_vec())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span as ProtoSpan};

    fn request_with(spans: Vec<ProtoSpan>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: None,
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans,
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
    }

    fn valid_proto_span() -> ProtoSpan {
        ProtoSpan {
            trace_id: hex::decode("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            span_id: hex::decode("00f067aa0ba902b7").unwrap(),
            name: "op".into(),
            start_time_unix_nano: 1_000,
            end_time_unix_nano: 2_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_accept_enqueues_valid_spans() {
        let (tx, mut rx) = mpsc::channel(16);
        let ingest = SpanIngest::new("t1", tx);

        ingest.accept(request_with(vec![valid_proto_span()])).await;

        let span = rx.recv().await.unwrap();
        assert_eq!(span.tenant_id, "t1");
        assert_eq!(span.operation_name, "op");
    }

    #[tokio::test]
    async fn test_malformed_span_is_dropped_not_fatal() {
        let (tx, mut rx) = mpsc::channel(16);
        let ingest = SpanIngest::new("t1", tx);

        let mut bad = valid_proto_span();
        bad.trace_id = vec![0xde, 0xad]; // wrong length
        ingest.accept(request_with(vec![bad, valid_proto_span()])).await;

        // Only the valid span comes through.
        let span = rx.recv().await.unwrap();
        assert_eq!(span.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_timestamp_dropped() {
        let (tx, mut rx) = mpsc::channel(16);
        let ingest = SpanIngest::new("t1", tx);

        let mut bad = valid_proto_span();
        bad.start_time_unix_nano = 0;
        ingest.accept(request_with(vec![bad])).await;
        assert!(rx.try_recv().is_err());
    }
}
