//! Append-only violation sink: the second capability handed to expressions.
//!
//! The sink validates tenant identity on every append. A record carrying a
//! foreign tenant id is a sandbox violation, not an error the expression can
//! observe and retry around.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::AttrValue;
use crate::rules::Severity;

/// Maximum entries retained in a violation's context map.
pub const MAX_CONTEXT_ENTRIES: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// Violation Record
// ═══════════════════════════════════════════════════════════════════════════════

/// One rule match against one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub tenant_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub trace_id: String,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
    /// Bounded context captured at match time; redacted before emission.
    pub context: BTreeMap<String, AttrValue>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Tenant-id mismatch on append.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("violation record tenant {record_tenant:?} does not match evaluator tenant {sink_tenant:?}")]
pub struct TenantMismatch {
    pub record_tenant: String,
    pub sink_tenant: String,
}

/// Append-only collector for one evaluation pass.
pub struct ViolationSink {
    tenant_id: String,
    records: Mutex<Vec<ViolationRecord>>,
}

impl ViolationSink {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Append a record after validating tenant identity and bounding context.
    pub fn push(&self, mut record: ViolationRecord) -> Result<(), TenantMismatch> {
        if record.tenant_id != self.tenant_id {
            return Err(TenantMismatch {
                record_tenant: record.tenant_id,
                sink_tenant: self.tenant_id.clone(),
            });
        }
        if record.context.len() > MAX_CONTEXT_ENTRIES {
            let keep: Vec<String> = record
                .context
                .keys()
                .take(MAX_CONTEXT_ENTRIES)
                .cloned()
                .collect();
            record.context.retain(|k, _| keep.contains(k));
        }
        self.records.lock().push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the sink, yielding collected records.
    pub fn into_records(self) -> Vec<ViolationRecord> {
        self.records.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: &str) -> ViolationRecord {
        ViolationRecord {
            tenant_id: tenant.into(),
            rule_id: "rule_0011223344556677".into(),
            rule_name: "r".into(),
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".into(),
            severity: Severity::Medium,
            description: "matched".into(),
            context: BTreeMap::new(),
        }
    }

    #[test]
    fn test_push_matching_tenant() {
        let sink = ViolationSink::new("t1");
        sink.push(record("t1")).unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_push_foreign_tenant_rejected() {
        let sink = ViolationSink::new("t1");
        let err = sink.push(record("t2")).unwrap_err();
        assert_eq!(err.record_tenant, "t2");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_context_is_bounded() {
        let sink = ViolationSink::new("t1");
        let mut r = record("t1");
        for i in 0..40 {
            r.context
                .insert(format!("key.{:03}", i), AttrValue::Int(i));
        }
        sink.push(r).unwrap();
        let records = sink.into_records();
        assert_eq!(records[0].context.len(), MAX_CONTEXT_ENTRIES);
    }
}
