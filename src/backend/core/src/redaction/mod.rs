//! PII detection and redaction.
//!
//! Applied to the context captured with each violation and to evidence-span
//! attributes before anything leaves the pipeline. Detection is regex-driven
//! and ordered; the first matching type wins. Output passes a whitelist
//! closure: a key must be explicitly whitelisted, a standard OpenTelemetry
//! semantic-convention key, or a processor-originated `betrace.*` key.
//! A value that still matches a PII pattern after redaction is a leak, and
//! the span carrying it is never exported.

use std::collections::{BTreeMap, HashMap, HashSet};

use metrics::counter;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::RedactionConfig;
use crate::model::{AttrValue, Span};

// ═══════════════════════════════════════════════════════════════════════════════
// PII Types & Strategies
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiType {
    Ssn,
    CreditCard,
    Email,
    Phone,
    Address,
    Name,
}

impl PiiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssn => "SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Address => "ADDRESS",
            Self::Name => "NAME",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SSN" => Some(Self::Ssn),
            "CREDIT_CARD" => Some(Self::CreditCard),
            "EMAIL" => Some(Self::Email),
            "PHONE" => Some(Self::Phone),
            "ADDRESS" => Some(Self::Address),
            "NAME" => Some(Self::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionStrategy {
    /// Drop the value entirely.
    Exclude,
    /// Replace with a fixed placeholder.
    Redact,
    /// Lowercase-hex SHA-256 of the UTF-8 bytes; deterministic across runs.
    Hash,
    /// Keep N leading and N trailing characters, elide the middle.
    Truncate,
    /// Keep the last 4 characters, star the rest.
    Mask,
}

impl RedactionStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "EXCLUDE" => Some(Self::Exclude),
            "REDACT" => Some(Self::Redact),
            "HASH" => Some(Self::Hash),
            "TRUNCATE" => Some(Self::Truncate),
            "MASK" => Some(Self::Mask),
            _ => None,
        }
    }
}

const REDACTED_PLACEHOLDER: &str = "<redacted>";

/// An explicit sensitivity marking attached to an attribute key, overriding
/// regex detection for that key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiAnnotation {
    /// Never emitted, whatever the value looks like.
    Sensitive,
    /// Redacted with the given strategy when any PII pattern matches.
    Pii(RedactionStrategy),
    /// Redacted unconditionally with a caller-chosen strategy.
    Redact {
        strategy: RedactionStrategy,
        preserve: usize,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detector
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered regex-backed PII detection. Order matters: an SSN would otherwise
/// be claimed by the looser phone pattern.
pub struct PiiDetector {
    patterns: Vec<(PiiType, Regex)>,
}

impl Default for PiiDetector {
    fn default() -> Self {
        let patterns = vec![
            (PiiType::Ssn, Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
            (
                PiiType::CreditCard,
                Regex::new(r"\b(?:\d{4}[ -]){3}\d{4}\b|\b\d{13,19}\b").unwrap(),
            ),
            (
                PiiType::Email,
                Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap(),
            ),
            (
                PiiType::Phone,
                Regex::new(r"\b(?:\+?1[-. ]?)?(?:\(\d{3}\)|\d{3})[-. ]?\d{3}[-. ]?\d{4}\b")
                    .unwrap(),
            ),
            (
                PiiType::Address,
                Regex::new(
                    r"(?i)\b\d{1,5}\s+[a-z0-9. ]+\s+(street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr)\b",
                )
                .unwrap(),
            ),
            (
                PiiType::Name,
                Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").unwrap(),
            ),
        ];
        Self { patterns }
    }
}

impl PiiDetector {
    /// First matching PII type, if any.
    pub fn detect(&self, value: &str) -> Option<PiiType> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(value))
            .map(|(ty, _)| *ty)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply one strategy to a value. `None` means the value is dropped.
pub fn apply_strategy(
    strategy: RedactionStrategy,
    value: &str,
    truncate_preserve: usize,
) -> Option<String> {
    match strategy {
        RedactionStrategy::Exclude => None,
        RedactionStrategy::Redact => Some(REDACTED_PLACEHOLDER.to_string()),
        RedactionStrategy::Hash => Some(hash_value(value)),
        RedactionStrategy::Truncate => {
            let n = truncate_preserve;
            let chars: Vec<char> = value.chars().collect();
            if chars.len() < 2 * n {
                Some("***".to_string())
            } else {
                let head: String = chars[..n].iter().collect();
                let tail: String = chars[chars.len() - n..].iter().collect();
                Some(format!("{}...{}", head, tail))
            }
        }
        RedactionStrategy::Mask => {
            let chars: Vec<char> = value.chars().collect();
            if chars.len() <= 4 {
                Some("****".to_string())
            } else {
                let stars = "*".repeat(chars.len() - 4);
                let tail: String = chars[chars.len() - 4..].iter().collect();
                Some(format!("{}{}", stars, tail))
            }
        }
    }
}

/// Lowercase-hex SHA-256, stable across runs and tenants for a given value.
pub fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redactor
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures that make the carrying span unexportable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RedactionError {
    #[error("attribute key not in output whitelist: {key}")]
    UnsafeAttribute { key: String },

    #[error("value still matches PII pattern {pii_type} after redaction: {key}")]
    PiiLeakage { key: String, pii_type: &'static str },
}

/// Standard OpenTelemetry semantic-convention keys always allowed out.
const STANDARD_OTEL_KEYS: &[&str] = &[
    "service.name",
    "service.version",
    "service.namespace",
    "http.method",
    "http.route",
    "http.status_code",
    "operation.name",
    "span.kind",
];

pub struct Redactor {
    detector: PiiDetector,
    strategies: HashMap<PiiType, RedactionStrategy>,
    annotations: HashMap<String, PiiAnnotation>,
    whitelist: HashSet<String>,
    truncate_preserve: usize,
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Self {
        let mut strategies = HashMap::from([
            (PiiType::Ssn, RedactionStrategy::Redact),
            (PiiType::CreditCard, RedactionStrategy::Mask),
            (PiiType::Email, RedactionStrategy::Hash),
            (PiiType::Phone, RedactionStrategy::Mask),
            (PiiType::Name, RedactionStrategy::Hash),
            (PiiType::Address, RedactionStrategy::Hash),
        ]);

        for (type_name, strategy_name) in &config.strategy_overrides {
            match (
                PiiType::from_name(type_name),
                RedactionStrategy::from_name(strategy_name),
            ) {
                (Some(ty), Some(strategy)) => {
                    strategies.insert(ty, strategy);
                }
                _ => {
                    warn!(
                        pii_type = %type_name,
                        strategy = %strategy_name,
                        "ignoring unrecognized redaction override"
                    );
                }
            }
        }

        Self {
            detector: PiiDetector::default(),
            strategies,
            annotations: HashMap::new(),
            whitelist: config.whitelist.iter().cloned().collect(),
            truncate_preserve: config.truncate_preserve,
        }
    }

    /// Attach an explicit annotation to an attribute key.
    pub fn with_annotation(mut self, key: impl Into<String>, annotation: PiiAnnotation) -> Self {
        self.annotations.insert(key.into(), annotation);
        self
    }

    fn key_allowed(&self, key: &str) -> bool {
        self.whitelist.contains(key)
            || key.starts_with("betrace.")
            || STANDARD_OTEL_KEYS.contains(&key)
    }

    fn strategy_for(&self, pii_type: PiiType) -> RedactionStrategy {
        // A detected type with no mapped strategy defaults to HASH.
        self.strategies
            .get(&pii_type)
            .copied()
            .unwrap_or(RedactionStrategy::Hash)
    }

    /// Redact one string value. Returns `None` when the value is excluded.
    fn redact_string(&self, key: &str, value: &str) -> Result<Option<String>, RedactionError> {
        let chosen = match self.annotations.get(key) {
            Some(PiiAnnotation::Sensitive) => return Ok(None),
            Some(PiiAnnotation::Redact { strategy, preserve }) => Some((*strategy, *preserve)),
            Some(PiiAnnotation::Pii(strategy)) => self
                .detector
                .detect(value)
                .map(|_| (*strategy, self.truncate_preserve)),
            None => self
                .detector
                .detect(value)
                .map(|ty| (self.strategy_for(ty), self.truncate_preserve)),
        };

        let Some((strategy, preserve)) = chosen else {
            return Ok(Some(value.to_string()));
        };
        let Some(redacted) = apply_strategy(strategy, value, preserve) else {
            return Ok(None);
        };

        if let Some(leak) = self.detector.detect(&redacted) {
            counter!("betrace_pii_leakage").increment(1);
            return Err(RedactionError::PiiLeakage {
                key: key.to_string(),
                pii_type: leak.as_str(),
            });
        }
        Ok(Some(redacted))
    }

    fn redact_value(&self, key: &str, value: AttrValue) -> Result<Option<AttrValue>, RedactionError> {
        match value {
            AttrValue::Str(s) => Ok(self.redact_string(key, &s)?.map(AttrValue::Str)),
            AttrValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(v) = self.redact_value(key, item)? {
                        out.push(v);
                    }
                }
                Ok(Some(AttrValue::List(out)))
            }
            AttrValue::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    if let Some(v) = self.redact_value(key, v)? {
                        out.insert(k, v);
                    }
                }
                Ok(Some(AttrValue::Map(out)))
            }
            primitive => Ok(Some(primitive)),
        }
    }

    /// Redact a violation context in place, enforcing the whitelist.
    pub fn redact_context(
        &self,
        context: BTreeMap<String, AttrValue>,
    ) -> Result<BTreeMap<String, AttrValue>, RedactionError> {
        let mut out = BTreeMap::new();
        for (key, value) in context {
            if !self.key_allowed(&key) {
                counter!("betrace_unsafe_attribute").increment(1);
                return Err(RedactionError::UnsafeAttribute { key });
            }
            if let Some(redacted) = self.redact_value(&key, value)? {
                out.insert(key, redacted);
            }
        }
        Ok(out)
    }

    /// Whitelist-closure check on a fully shaped outgoing span.
    ///
    /// The span is rejected, not repaired: by the time the emitter calls
    /// this, every value should already have been through redaction.
    pub fn check_span(&self, span: &Span) -> Result<(), RedactionError> {
        for (key, value) in &span.attributes {
            if !self.key_allowed(key) {
                counter!("betrace_unsafe_attribute").increment(1);
                return Err(RedactionError::UnsafeAttribute { key: key.clone() });
            }
            if let AttrValue::Str(s) = value {
                // The signature attribute is base64 and may embed digit runs;
                // it is processor-generated, never author data.
                if key == "betrace.compliance.signature" {
                    continue;
                }
                if let Some(leak) = self.detector.detect(s) {
                    counter!("betrace_pii_leakage").increment(1);
                    return Err(RedactionError::PiiLeakage {
                        key: key.clone(),
                        pii_type: leak.as_str(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
