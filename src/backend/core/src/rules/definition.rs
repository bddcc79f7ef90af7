//! Rule definitions and deterministic rule-id derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Violation severity carried on emitted spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// An author-supplied pattern rule.
///
/// The id is a pure function of (tenant, name, expression): renaming or
/// editing a rule yields a new id, which is what invalidates any compiled
/// form cached under the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub name: String,
    /// DSL-v2 expression text
    pub expression: String,
    pub active: bool,
    #[serde(default)]
    pub severity: Severity,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    /// Set when the expression failed to compile; the rule is inert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
}

impl RuleDefinition {
    pub fn new(
        tenant_id: &str,
        name: impl Into<String>,
        expression: impl Into<String>,
        active: bool,
    ) -> Self {
        let name = name.into();
        let expression = expression.into();
        Self {
            id: derive_rule_id(tenant_id, &name, &expression),
            name,
            expression,
            active,
            severity: Severity::default(),
            version: 1,
            updated_at: Utc::now(),
            compile_error: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Whether this rule should be evaluated.
    pub fn is_evaluable(&self) -> bool {
        self.active && self.compile_error.is_none()
    }
}

/// Derive the stable rule id: `"rule_" + hex(sha256(tenant:name:expression)[0..8])`.
pub fn derive_rule_id(tenant_id: &str, name: &str, expression: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(expression.as_bytes());
    let digest = hasher.finalize();
    format!("rule_{}", hex::encode(&digest[..8]))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
