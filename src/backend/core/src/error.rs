//! Production-grade error handling for BeTrace Core.
//!
//! This module provides:
//! - Comprehensive error types with context and chaining
//! - HTTP status code mapping for the control-plane API
//! - Error codes for machine-readable API responses
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use betrace_core::error::{BeTraceError, Result};
//!
//! fn my_function() -> Result<()> {
//!     some_operation()
//!         .map_err(|e| BeTraceError::internal(e.to_string()))?;
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for BeTrace operations.
pub type Result<T> = std::result::Result<T, BeTraceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Span Errors (1000-1099)
    MalformedSpan,
    InvalidTraceId,
    MissingTimestamp,
    TraceNotFound,

    // Rule Errors (1100-1199)
    RuleNotFound,
    RuleParseError,
    RuleInert,
    DuplicateRule,

    // Evaluation Errors (1200-1299)
    EvaluationFailed,
    CpuBudgetExceeded,
    MemoryCeilingExceeded,
    SandboxViolation,
    TenantMismatch,

    // Redaction Errors (1300-1399)
    UnsafeAttribute,
    PiiLeakage,

    // Signing Errors (1400-1499)
    SigningFailed,
    KeyUnavailable,

    // Export Errors (2000-2099)
    ExportFailed,
    ExportRetriesExhausted,
    ReceiverError,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,
    MaliciousInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Span Errors
            Self::MalformedSpan => 1000,
            Self::InvalidTraceId => 1001,
            Self::MissingTimestamp => 1002,
            Self::TraceNotFound => 1003,

            // Rule Errors
            Self::RuleNotFound => 1100,
            Self::RuleParseError => 1101,
            Self::RuleInert => 1102,
            Self::DuplicateRule => 1103,

            // Evaluation Errors
            Self::EvaluationFailed => 1200,
            Self::CpuBudgetExceeded => 1201,
            Self::MemoryCeilingExceeded => 1202,
            Self::SandboxViolation => 1203,
            Self::TenantMismatch => 1204,

            // Redaction Errors
            Self::UnsafeAttribute => 1300,
            Self::PiiLeakage => 1301,

            // Signing Errors
            Self::SigningFailed => 1400,
            Self::KeyUnavailable => 1401,

            // Export Errors
            Self::ExportFailed => 2000,
            Self::ExportRetriesExhausted => 2001,
            Self::ReceiverError => 2002,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            // Validation Errors
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,
            Self::MaliciousInput => 4103,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::RuleNotFound | Self::TraceNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::DuplicateRule => StatusCode::CONFLICT,

            // Bad Request (400)
            Self::MaliciousInput | Self::InvalidInput => StatusCode::BAD_REQUEST,

            // Unprocessable Entity (422)
            Self::MalformedSpan
            | Self::InvalidTraceId
            | Self::MissingTimestamp
            | Self::RuleParseError
            | Self::RuleInert
            | Self::ValidationError
            | Self::MissingRequiredField => StatusCode::UNPROCESSABLE_ENTITY,

            // Forbidden (403)
            Self::SandboxViolation | Self::TenantMismatch => StatusCode::FORBIDDEN,

            // Timeout (504)
            Self::CpuBudgetExceeded => StatusCode::GATEWAY_TIMEOUT,

            // Service Unavailable (503)
            Self::ExportFailed | Self::ExportRetriesExhausted | Self::KeyUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // Internal Server Error (500)
            Self::EvaluationFailed
            | Self::MemoryCeilingExceeded
            | Self::UnsafeAttribute
            | Self::PiiLeakage
            | Self::SigningFailed
            | Self::ReceiverError
            | Self::SerializationError
            | Self::DeserializationError
            | Self::InvalidJson
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExportFailed | Self::KeyUnavailable | Self::ReceiverError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "span",
            1100..=1199 => "rule",
            1200..=1299 => "evaluation",
            1300..=1399 => "redaction",
            1400..=1499 => "signing",
            2000..=2099 => "export",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, validation failures)
    Low,
    /// Operational issues (budgets, timeouts, dropped data)
    Medium,
    /// System errors (export failures, pipeline bugs)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            // Low severity - user errors
            ErrorCode::RuleNotFound
            | ErrorCode::TraceNotFound
            | ErrorCode::DuplicateRule
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::MalformedSpan
            | ErrorCode::InvalidTraceId
            | ErrorCode::MissingTimestamp
            | ErrorCode::RuleParseError
            | ErrorCode::RuleInert => Self::Low,

            // Medium severity - operational
            ErrorCode::CpuBudgetExceeded
            | ErrorCode::MemoryCeilingExceeded
            | ErrorCode::EvaluationFailed
            | ErrorCode::SigningFailed
            | ErrorCode::ExportFailed => Self::Medium,

            // High severity - system errors and security signals
            ErrorCode::SandboxViolation
            | ErrorCode::TenantMismatch
            | ErrorCode::MaliciousInput
            | ErrorCode::UnsafeAttribute
            | ErrorCode::PiiLeakage
            | ErrorCode::KeyUnavailable
            | ErrorCode::ExportRetriesExhausted
            | ErrorCode::ReceiverError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson => Self::High,

            // Critical severity
            ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (rule, trace, span)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for BeTrace Core.
///
/// This error type supports:
/// - Structured error codes for API responses
/// - Error chaining with context
/// - User-friendly vs internal messages
/// - HTTP status code mapping
/// - Metrics integration
#[derive(Error, Debug)]
pub struct BeTraceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for BeTraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl BeTraceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RuleNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a malicious-input error (control-plane sanitizer rejection).
    pub fn malicious_input(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MaliciousInput,
            "Malicious input detected",
            detail,
        )
    }

    /// Create a configuration error (fatal at startup).
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the severity of this error.
    pub const fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message, if any.
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the structured details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging & Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "betrace_errors_total",
            "code" => format!("{:?}", self.code),
            "category" => self.code.category(),
        )
        .increment(1);
    }

    /// Log this error at the appropriate level for its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low => {
                tracing::debug!(code = %self.code, error = %self, "error");
            }
            ErrorSeverity::Medium => {
                warn!(code = %self.code, error = %self, "error");
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(code = %self.code, error = %self, "error");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response Mapping
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body returned to control-plane clients on error.
#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    success: bool,
    error: &'a str,
    error_code: ErrorCode,
    numeric_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a ErrorDetails>,
}

impl IntoResponse for BeTraceError {
    fn into_response(self) -> Response {
        self.log();

        let has_details = !self.details.context.is_empty()
            || self.details.entity_id.is_some()
            || self.details.retry_after_secs.is_some();

        let body = ErrorResponse {
            success: false,
            error: self.user_message(),
            error_code: self.code,
            numeric_code: self.code.numeric_code(),
            details: has_details.then_some(&self.details),
        };

        (self.code.http_status(), Json(&body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for BeTraceError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidJson,
            "Invalid JSON payload",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<config::ConfigError> for BeTraceError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<tonic::transport::Error> for BeTraceError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::with_internal(
            ErrorCode::ExportFailed,
            "Transport error",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_are_unique_per_category() {
        assert_eq!(ErrorCode::MalformedSpan.numeric_code(), 1000);
        assert_eq!(ErrorCode::RuleParseError.numeric_code(), 1101);
        assert_eq!(ErrorCode::SandboxViolation.numeric_code(), 1203);
        assert_eq!(ErrorCode::UnsafeAttribute.numeric_code(), 1300);
        assert_eq!(ErrorCode::SigningFailed.numeric_code(), 1400);
    }

    #[test]
    fn test_category_grouping() {
        assert_eq!(ErrorCode::InvalidTraceId.category(), "span");
        assert_eq!(ErrorCode::RuleInert.category(), "rule");
        assert_eq!(ErrorCode::TenantMismatch.category(), "evaluation");
        assert_eq!(ErrorCode::PiiLeakage.category(), "redaction");
        assert_eq!(ErrorCode::ExportRetriesExhausted.category(), "export");
        assert_eq!(ErrorCode::ConfigurationError.category(), "configuration");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            ErrorCode::RuleNotFound.http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ErrorCode::MaliciousInput.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorCode::SandboxViolation.http_status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::RuleParseError),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CpuBudgetExceeded),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::SandboxViolation),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ConfigurationError),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let err = BeTraceError::with_internal(
            ErrorCode::RuleParseError,
            "Rule failed to parse",
            "unexpected token at offset 12",
        );
        let s = err.to_string();
        assert!(s.contains("RuleParseError"));
        assert!(s.contains("unexpected token"));
    }

    #[test]
    fn test_not_found_builder() {
        let err = BeTraceError::not_found("rule", "rule_ab12cd34");
        assert_eq!(err.code(), ErrorCode::RuleNotFound);
        assert_eq!(err.details().entity_id.as_deref(), Some("rule_ab12cd34"));
    }

    #[test]
    fn test_retryable() {
        assert!(BeTraceError::new(ErrorCode::ExportFailed, "x").is_retryable());
        assert!(!BeTraceError::new(ErrorCode::RuleParseError, "x").is_retryable());
    }
}
