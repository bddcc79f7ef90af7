//! # BeTrace Core
//!
//! Behavioral-assurance trace processor: ingests OpenTelemetry spans,
//! evaluates a catalog of pattern-matching rules against each assembled
//! trace, and emits violation and compliance-evidence spans back into the
//! trace stream.
//!
//! ## Architecture
//!
//! - **Model & Assembler**: span normalization and trace completion policy
//! - **Rules**: deterministic rule ids and the snapshot registry
//! - **DSL**: lexer, recursive-descent parser, bounded compile cache
//! - **Evaluator**: capability-sandboxed AST walker with CPU/memory budgets
//! - **Redaction**: regex PII detection, per-type strategies, output whitelist
//! - **Emitter & Signer**: violation/evidence span shaping with HMAC tags
//! - **Audit**: sandbox-violation spans and per-tenant attack-rate counters
//! - **Pipeline**: receivers, batching, worker pool, retrying OTLP export

pub mod api;
pub mod assembler;
pub mod audit;
pub mod config;
pub mod dsl;
pub mod emitter;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod redaction;
pub mod rules;
pub mod signer;

pub use error::{BeTraceError, ErrorCode, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::assembler::TraceAssembler;
    pub use crate::audit::{AuditLogger, SandboxBreach, SANDBOX_VIOLATION_SPAN_NAME};
    pub use crate::config::Config;
    pub use crate::dsl::{CompileError, CompiledExpression, ExpressionCache};
    pub use crate::emitter::{
        EvidenceEvent, EvidenceOutcome, SpanEmitter, EVIDENCE_SPAN_NAME, VIOLATION_SPAN_NAME,
    };
    pub use crate::error::{BeTraceError, ErrorCode, ErrorSeverity, Result};
    pub use crate::evaluator::{
        EvaluationResult, RuleOutcome, RuleStatus, SandboxedEvaluator, SpanView, ViolationRecord,
        ViolationSink,
    };
    pub use crate::model::{AttrValue, Span, SpanKind, SpanStatus, Trace};
    pub use crate::pipeline::{
        CollectingExporter, OtlpExporter, Pipeline, SpanExporter, SpanIngest, SERVICE_NAME,
    };
    pub use crate::redaction::{PiiAnnotation, PiiDetector, PiiType, RedactionStrategy, Redactor};
    pub use crate::rules::{derive_rule_id, RuleDefinition, RuleRegistry, Severity};
    pub use crate::signer::{
        canonical_form, CanonicalFields, ComplianceSigner, KeySource, StaticKeySource,
        SIGNATURE_ATTRIBUTE, SIGNING_FAILED,
    };
}
