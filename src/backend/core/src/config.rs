//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration (listeners)
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenant identity for this deployment
    #[serde(default)]
    pub tenant: TenantConfig,

    /// Pipeline batching
    #[serde(default)]
    pub batch: BatchConfig,

    /// Trace-assembler completion policy
    #[serde(default)]
    pub trace: TraceConfig,

    /// Per-rule execution caps
    #[serde(default)]
    pub rule: RuleConfig,

    /// PII redaction policy
    #[serde(default)]
    pub redaction: RedactionConfig,

    /// Evidence-span signer
    #[serde(default)]
    pub signer: SignerConfig,

    /// Downstream OTLP export
    #[serde(default)]
    pub export: ExportConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen host for all servers
    #[serde(default = "default_host")]
    pub host: String,

    /// Control-plane HTTP port (rules, health, metrics)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// OTLP gRPC receiver port
    #[serde(default = "default_otlp_grpc_port")]
    pub otlp_grpc_port: u16,

    /// OTLP HTTP/protobuf receiver port
    #[serde(default = "default_otlp_http_port")]
    pub otlp_http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            otlp_grpc_port: default_otlp_grpc_port(),
            otlp_http_port: default_otlp_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Single-tenant deployment identity attached to every ingested span.
    #[serde(default = "default_tenant_id")]
    pub id: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            id: default_tenant_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum spans accumulated before dispatch
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Maximum wait before a partial batch is dispatched
    #[serde(with = "humantime_serde", default = "default_batch_timeout")]
    pub timeout: Duration,

    /// Concurrent evaluation workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// End-to-end span-to-emit latency budget
    #[serde(with = "humantime_serde", default = "default_latency_budget")]
    pub latency_budget: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            timeout: default_batch_timeout(),
            workers: default_workers(),
            latency_budget: default_latency_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Quiet interval after root-span end before a trace is evaluated
    #[serde(with = "humantime_serde", default = "default_quiet_interval")]
    pub quiet_interval: Duration,

    /// Maximum in-memory age before a trace is evaluated as truncated
    #[serde(with = "humantime_serde", default = "default_max_age")]
    pub max_age: Duration,

    /// Per-tenant resident span cap; oldest-arrived traces evicted beyond it
    #[serde(default = "default_max_resident_spans")]
    pub max_resident_spans: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            quiet_interval: default_quiet_interval(),
            max_age: default_max_age(),
            max_resident_spans: default_max_resident_spans(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// CPU-time budget per rule per trace (milliseconds)
    #[serde(default = "default_cpu_budget_ms")]
    pub cpu_budget_ms: u64,

    /// Memory ceiling per rule evaluation (bytes)
    #[serde(default = "default_memory_ceiling_bytes")]
    pub memory_ceiling_bytes: u64,

    /// Compiled-expression cache capacity (entries)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            cpu_budget_ms: default_cpu_budget_ms(),
            memory_ceiling_bytes: default_memory_ceiling_bytes(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedactionConfig {
    /// Attribute keys allowed to leave the pipeline
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,

    /// PII-type name -> strategy name overrides (e.g. "EMAIL" -> "MASK")
    #[serde(default)]
    pub strategy_overrides: HashMap<String, String>,

    /// Characters preserved at each end by the TRUNCATE strategy
    #[serde(default = "default_truncate_preserve")]
    pub truncate_preserve: usize,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            whitelist: default_whitelist(),
            strategy_overrides: HashMap::new(),
            truncate_preserve: default_truncate_preserve(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Identifier for the key-management collaborator
    #[serde(default = "default_key_source")]
    pub key_source: String,

    /// Master secret for the bundled static key source (hex)
    pub master_key_hex: Option<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            key_source: default_key_source(),
            master_key_hex: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Downstream OTLP/gRPC endpoint (trace store)
    #[serde(default = "default_export_endpoint")]
    pub endpoint: String,

    /// Skip TLS verification on the export channel
    #[serde(default)]
    pub tls_insecure: bool,

    /// Initial retry backoff (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Retry backoff cap (milliseconds)
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,

    /// Maximum export attempts before a batch is dropped
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_export_endpoint(),
            tls_insecure: false,
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint for the processor's own traces
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 8080 }
fn default_otlp_grpc_port() -> u16 { 4317 }
fn default_otlp_http_port() -> u16 { 4318 }
fn default_tenant_id() -> String { "default".to_string() }
fn default_batch_size() -> usize { 100 }
fn default_batch_timeout() -> Duration { Duration::from_secs(1) }
fn default_workers() -> usize { 8 }
fn default_latency_budget() -> Duration { Duration::from_millis(500) }
fn default_quiet_interval() -> Duration { Duration::from_millis(500) }
fn default_max_age() -> Duration { Duration::from_secs(60) }
fn default_max_resident_spans() -> usize { 100_000 }
fn default_cpu_budget_ms() -> u64 { 50 }
fn default_memory_ceiling_bytes() -> u64 { 16 * 1024 * 1024 }
fn default_cache_capacity() -> usize { 1024 }
fn default_truncate_preserve() -> usize { 4 }
fn default_key_source() -> String { "static".to_string() }
fn default_export_endpoint() -> String { "http://localhost:4317".to_string() }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_retry_backoff_cap_ms() -> u64 { 5_000 }
fn default_retry_max_attempts() -> u32 { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

fn default_whitelist() -> Vec<String> {
    [
        "user.email",
        "user.ssn",
        "user.name",
        "user.address",
        "user.phone",
        "payment.card_number",
        "payment.amount",
        "http.status_code",
        "http.method",
        "http.route",
        "amount",
        "rule.name",
        "trace.id",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BETRACE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("BETRACE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
