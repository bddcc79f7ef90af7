//! Bounded compiled-expression cache.
//!
//! Keyed by rule id, LRU-evicted under pressure, invalidated on rule change.
//! A "compiling" token in the map deduplicates concurrent compiles: the
//! thread that planted the token publishes the result, any racer compiles
//! on the fly for its own invocation without touching the map.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tracing::debug;

use super::ast::CompiledExpression;
use super::parser::{parse_rule, CompileError};
use crate::rules::RuleDefinition;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════════

enum Slot {
    Ready(Arc<CompiledExpression>),
    Compiling,
}

struct CacheInner {
    slots: HashMap<String, Slot>,
    /// Recency queue, least-recent at the front. May hold stale ids; they
    /// are skipped at eviction time.
    recency: VecDeque<String>,
}

/// Statistics snapshot for the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ExpressionCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    stats: Mutex<CacheStats>,
}

impl ExpressionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
                recency: VecDeque::new(),
            }),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Fetch the compiled form for a rule, compiling and caching on miss.
    ///
    /// A concurrent compile of the same rule falls back to an on-the-fly
    /// compile for this invocation only.
    pub fn get_or_compile(
        &self,
        rule: &RuleDefinition,
    ) -> Result<Arc<CompiledExpression>, CompileError> {
        {
            let mut inner = self.inner.lock();
            match inner.slots.get(&rule.id) {
                Some(Slot::Ready(compiled)) => {
                    let compiled = compiled.clone();
                    let id = rule.id.clone();
                    inner.recency.retain(|k| k != &id);
                    inner.recency.push_back(id);
                    self.stats.lock().hits += 1;
                    return Ok(compiled);
                }
                Some(Slot::Compiling) => {
                    // Another worker owns the slot; compile privately.
                    self.stats.lock().misses += 1;
                    return parse_rule(&rule.id, &rule.expression).map(Arc::new);
                }
                None => {
                    inner.slots.insert(rule.id.clone(), Slot::Compiling);
                }
            }
        }
        self.stats.lock().misses += 1;

        match parse_rule(&rule.id, &rule.expression) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                let mut inner = self.inner.lock();
                inner.slots.insert(rule.id.clone(), Slot::Ready(compiled.clone()));
                inner.recency.push_back(rule.id.clone());
                self.evict_over_capacity(&mut inner);
                debug!(rule_id = %rule.id, "expression compiled and cached");
                Ok(compiled)
            }
            Err(e) => {
                // Drop the token so a corrected rule can compile later.
                self.inner.lock().slots.remove(&rule.id);
                counter!("betrace_rules_inert").increment(1);
                Err(e)
            }
        }
    }

    /// Drop the entry for a retired rule id.
    pub fn invalidate(&self, rule_id: &str) {
        let mut inner = self.inner.lock();
        if inner.slots.remove(rule_id).is_some() {
            debug!(rule_id = %rule_id, "compiled expression invalidated");
        }
        inner.recency.retain(|k| k != rule_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.entries = self.len();
        stats
    }

    fn evict_over_capacity(&self, inner: &mut CacheInner) {
        while inner.slots.len() > self.capacity {
            let Some(victim) = inner.recency.pop_front() else {
                break;
            };
            // Only evict Ready entries; a Compiling token is not resident data.
            if matches!(inner.slots.get(&victim), Some(Slot::Ready(_))) {
                inner.slots.remove(&victim);
                self.stats.lock().evictions += 1;
                debug!(rule_id = %victim, "compiled expression evicted (capacity)");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
