//! Rule registry with snapshot semantics.
//!
//! Single writer (the admin control plane), many readers (pipeline workers).
//! Readers take an `Arc<RuleSnapshot>` published by pointer swap, so a reader
//! never observes a partially updated catalog.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

use super::definition::{derive_rule_id, RuleDefinition};

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable view of the rule catalog at one instant.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: HashMap<String, RuleDefinition>,
}

impl RuleSnapshot {
    pub fn get(&self, id: &str) -> Option<&RuleDefinition> {
        self.rules.get(id)
    }

    /// Rules that should be evaluated: active and not inert.
    pub fn active_rules(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.rules.values().filter(|r| r.is_evaluable())
    }

    pub fn all_rules(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Observer invoked when a rule id is retired (edit or delete), so the
/// compiled-expression cache can drop the stale entry.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Holds the live rule catalog for one tenant deployment.
pub struct RuleRegistry {
    tenant_id: String,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    invalidation: RwLock<Vec<InvalidationHook>>,
}

impl RuleRegistry {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
            invalidation: RwLock::new(Vec::new()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Register a hook called with each retired rule id.
    pub fn on_invalidate(&self, hook: InvalidationHook) {
        self.invalidation.write().push(hook);
    }

    /// Current immutable snapshot; cheap to clone, safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().clone()
    }

    /// Upsert a rule; returns the derived id.
    ///
    /// An edit under the same name produces a new id; the definition stored
    /// under the old id is retired and its compiled form invalidated.
    pub fn put(&self, name: &str, expression: &str, active: bool) -> String {
        let id = derive_rule_id(&self.tenant_id, name, expression);

        let mut guard = self.snapshot.write();
        let mut rules = guard.rules.clone();

        // Retire any previous definition that carried the same name.
        let retired: Vec<String> = rules
            .values()
            .filter(|r| r.name == name && r.id != id)
            .map(|r| r.id.clone())
            .collect();
        for old_id in &retired {
            rules.remove(old_id);
        }

        let version = rules.get(&id).map(|r| r.version + 1).unwrap_or(1);
        let mut rule = RuleDefinition::new(&self.tenant_id, name, expression, active);
        rule.version = version;
        rule.updated_at = Utc::now();
        rules.insert(id.clone(), rule);

        *guard = Arc::new(RuleSnapshot { rules });
        drop(guard);

        for old_id in &retired {
            self.notify_invalidate(old_id);
        }
        info!(rule_id = %id, rule_name = %name, active, "rule upserted");
        id
    }

    /// Record a compile failure so the rule is inert but still listable.
    pub fn mark_inert(&self, id: &str, error: impl Into<String>) {
        let mut guard = self.snapshot.write();
        let mut rules = guard.rules.clone();
        if let Some(rule) = rules.get_mut(id) {
            rule.compile_error = Some(error.into());
            *guard = Arc::new(RuleSnapshot { rules });
        }
    }

    /// Delete a rule by id. Returns true if it existed.
    pub fn delete(&self, id: &str) -> bool {
        let mut guard = self.snapshot.write();
        let mut rules = guard.rules.clone();
        let existed = rules.remove(id).is_some();
        if existed {
            *guard = Arc::new(RuleSnapshot { rules });
            drop(guard);
            self.notify_invalidate(id);
            info!(rule_id = %id, "rule deleted");
        }
        existed
    }

    /// Fetch one rule.
    pub fn get(&self, id: &str) -> Option<RuleDefinition> {
        self.snapshot.read().get(id).cloned()
    }

    fn notify_invalidate(&self, id: &str) {
        for hook in self.invalidation.read().iter() {
            hook(id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_put_returns_deterministic_id() {
        let registry = RuleRegistry::new("t1");
        let id1 = registry.put("r", "when { a } always { b }", true);
        let id2 = registry.put("r", "when { a } always { b }", true);
        assert_eq!(id1, id2);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_edit_produces_new_id_and_retires_old() {
        let registry = RuleRegistry::new("t1");
        let old_id = registry.put("r", "when { a } always { b }", true);
        let new_id = registry.put("r", "when { a } never { c }", true);

        assert_ne!(old_id, new_id);
        assert!(registry.get(&old_id).is_none());
        assert!(registry.get(&new_id).is_some());
    }

    #[test]
    fn test_invalidation_hook_fires_on_edit_and_delete() {
        let registry = RuleRegistry::new("t1");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        registry.on_invalidate(Arc::new(move |_id| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let id = registry.put("r", "when { a } always { b }", true);
        registry.put("r", "when { a } never { c }", true); // edit retires old id
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let new_id = derive_rule_id("t1", "r", "when { a } never { c }");
        assert_ne!(id, new_id);
        registry.delete(&new_id);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let registry = RuleRegistry::new("t1");
        registry.put("r1", "when { a } always { b }", true);
        let snap = registry.snapshot();
        registry.put("r2", "when { c } always { d }", true);

        assert_eq!(snap.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_inactive_rules_excluded_from_active_set() {
        let registry = RuleRegistry::new("t1");
        registry.put("on", "when { a } always { b }", true);
        registry.put("off", "when { c } always { d }", false);

        let snap = registry.snapshot();
        assert_eq!(snap.active_rules().count(), 1);
        assert_eq!(snap.all_rules().count(), 2);
    }

    #[test]
    fn test_mark_inert_removes_from_active_set() {
        let registry = RuleRegistry::new("t1");
        let id = registry.put("r", "when { a } always { b }", true);
        registry.mark_inert(&id, "parse error");

        let snap = registry.snapshot();
        assert_eq!(snap.active_rules().count(), 0);
        assert_eq!(
            snap.get(&id).unwrap().compile_error.as_deref(),
            Some("parse error")
        );
    }

    #[test]
    fn test_version_increments_on_reupsert() {
        let registry = RuleRegistry::new("t1");
        let id = registry.put("r", "when { a } always { b }", true);
        registry.put("r", "when { a } always { b }", false);
        assert_eq!(registry.get(&id).unwrap().version, 2);
    }
}
