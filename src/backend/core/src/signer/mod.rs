//! Compliance-span signing.
//!
//! Each evidence span gets an HMAC-SHA256 tag over a canonical byte form:
//! fixed field order, pipe-delimited, null fields as empty strings:
//!
//! ```text
//! traceId | spanId | tenantId | framework | control | evidenceType | RFC3339-timestamp
//! ```
//!
//! Signing failures never block emission: the span is exported with the
//! literal `"signing_failed"` marker so its absence of integrity is itself
//! visible downstream. Keys are per-tenant, fetched once from the key
//! source and cached; rotation invalidates the cache.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use metrics::counter;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::model::{AttrValue, Span};

type HmacSha256 = Hmac<Sha256>;

/// Marker value attached when a signature could not be produced.
pub const SIGNING_FAILED: &str = "signing_failed";

/// Attribute carrying the tag. The signature field is itself an attribute.
pub const SIGNATURE_ATTRIBUTE: &str = "betrace.compliance.signature";

// ═══════════════════════════════════════════════════════════════════════════════
// Key Source
// ═══════════════════════════════════════════════════════════════════════════════

/// The key-management collaborator, abstracted so deployments can plug in
/// an external manager.
pub trait KeySource: Send + Sync {
    /// The signing key for a tenant, or `None` when unavailable.
    fn key_for(&self, tenant_id: &str) -> Option<Vec<u8>>;
}

/// In-process key source deriving one stable key per tenant from a master
/// secret.
pub struct StaticKeySource {
    master: Vec<u8>,
}

impl StaticKeySource {
    pub fn new(master: impl Into<Vec<u8>>) -> Self {
        Self {
            master: master.into(),
        }
    }
}

impl KeySource for StaticKeySource {
    fn key_for(&self, tenant_id: &str) -> Option<Vec<u8>> {
        if self.master.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.master);
        hasher.update(b"/");
        hasher.update(tenant_id.as_bytes());
        Some(hasher.finalize().to_vec())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Canonical Form
// ═══════════════════════════════════════════════════════════════════════════════

/// Fields entering the canonical byte string.
#[derive(Debug, Clone, Default)]
pub struct CanonicalFields<'a> {
    pub trace_id: &'a str,
    pub span_id: &'a str,
    pub tenant_id: &'a str,
    pub framework: &'a str,
    pub control: &'a str,
    pub evidence_type: &'a str,
    pub timestamp: &'a str,
}

/// Derive the canonical byte form. Field order is fixed; absent fields are
/// already empty strings by construction.
pub fn canonical_form(fields: &CanonicalFields<'_>) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        fields.trace_id,
        fields.span_id,
        fields.tenant_id,
        fields.framework,
        fields.control,
        fields.evidence_type,
        fields.timestamp,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Signer
// ═══════════════════════════════════════════════════════════════════════════════

/// Signs evidence spans and verifies previously attached tags.
pub struct ComplianceSigner {
    key_source: Arc<dyn KeySource>,
    key_cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl ComplianceSigner {
    pub fn new(key_source: Arc<dyn KeySource>) -> Self {
        Self {
            key_source,
            key_cache: RwLock::new(HashMap::new()),
        }
    }

    fn key_for(&self, tenant_id: &str) -> Option<Vec<u8>> {
        if let Some(key) = self.key_cache.read().get(tenant_id) {
            return Some(key.clone());
        }
        let key = self.key_source.key_for(tenant_id)?;
        self.key_cache
            .write()
            .insert(tenant_id.to_string(), key.clone());
        Some(key)
    }

    /// Drop the cached key for a tenant; the next signature re-fetches.
    pub fn rotate(&self, tenant_id: &str) {
        self.key_cache.write().remove(tenant_id);
    }

    /// Sign canonical fields; `None` when the key is unavailable.
    pub fn sign_fields(&self, fields: &CanonicalFields<'_>) -> Option<String> {
        let key = self.key_for(fields.tenant_id)?;
        let mut mac = HmacSha256::new_from_slice(&key).ok()?;
        mac.update(canonical_form(fields).as_bytes());
        Some(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Attach the signature attribute to an evidence span.
    ///
    /// A missing tenant id or unavailable key produces the
    /// `"signing_failed"` marker rather than an error; emission proceeds
    /// either way.
    pub fn sign_span(&self, span: &mut Span) {
        let tag = if span.tenant_id.is_empty() {
            None
        } else {
            let fields = Self::fields_of(span);
            self.sign_fields(&fields)
        };

        let value = match tag {
            Some(tag) => tag,
            None => {
                counter!("betrace_signing_failures").increment(1);
                warn!(trace_id = %span.trace_id, "evidence span signing failed");
                SIGNING_FAILED.to_string()
            }
        };
        span.attributes
            .insert(SIGNATURE_ATTRIBUTE.to_string(), AttrValue::Str(value));
    }

    /// Verification contract for downstream readers: recompute the canonical
    /// form from the span's declared fields and compare tags.
    pub fn verify_span(&self, span: &Span) -> bool {
        let Some(AttrValue::Str(attached)) = span.attribute(SIGNATURE_ATTRIBUTE) else {
            return false;
        };
        if attached == SIGNING_FAILED {
            return false;
        }
        let fields = Self::fields_of(span);
        match self.sign_fields(&fields) {
            Some(expected) => &expected == attached,
            None => false,
        }
    }

    fn fields_of(span: &Span) -> CanonicalFields<'_> {
        let attr = |key: &str| -> &str {
            span.attribute(key)
                .and_then(AttrValue::as_str)
                .unwrap_or("")
        };
        CanonicalFields {
            trace_id: &span.trace_id,
            span_id: &span.span_id,
            tenant_id: &span.tenant_id,
            framework: attr("betrace.compliance.framework"),
            control: attr("betrace.compliance.control"),
            evidence_type: attr("betrace.compliance.evidenceType"),
            timestamp: attr("betrace.compliance.timestamp"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
