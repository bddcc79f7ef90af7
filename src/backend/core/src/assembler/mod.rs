//! Trace assembly: groups incoming spans by trace id and decides when a
//! trace is complete enough to evaluate.
//!
//! Completion policy:
//! - the root span has ended and a quiet interval has passed with no new
//!   spans for the trace, or
//! - the trace reached its max in-memory age; it is evaluated as-is and
//!   flagged truncated.
//!
//! If both predicates hold in one sweep the quiet-interval path wins; it
//! always fires at an earlier deadline than max-age for the same trace.
//! A resident span cap bounds memory: oldest-arrived traces are evicted
//! first and counted, never silently.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::TraceConfig;
use crate::model::{Span, Trace};

// ═══════════════════════════════════════════════════════════════════════════════
// Assembler
// ═══════════════════════════════════════════════════════════════════════════════

struct PendingTrace {
    trace: Trace,
    first_arrival: Instant,
    last_arrival: Instant,
    root_ended: bool,
}

struct AssemblerInner {
    pending: HashMap<String, PendingTrace>,
    /// Trace ids in first-arrival order, for cap eviction.
    arrival_order: VecDeque<String>,
    resident_spans: usize,
}

/// Groups spans into traces and releases them per the completion policy.
///
/// Thread-safe; the receiver and the sweep task share one instance.
pub struct TraceAssembler {
    config: TraceConfig,
    inner: Mutex<AssemblerInner>,
}

impl TraceAssembler {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AssemblerInner {
                pending: HashMap::new(),
                arrival_order: VecDeque::new(),
                resident_spans: 0,
            }),
        }
    }

    /// Accept one validated span into its trace accumulator.
    pub fn ingest(&self, span: Span) {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let trace_id = span.trace_id.clone();
        let is_root_end = span.parent_span_id.is_none() && span.has_ended();

        let pending = match inner.pending.entry(trace_id.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                inner.arrival_order.push_back(trace_id);
                e.insert(PendingTrace {
                    trace: Trace::new(span.trace_id.clone()),
                    first_arrival: now,
                    last_arrival: now,
                    root_ended: false,
                })
            }
        };

        pending.trace.push(span);
        pending.last_arrival = now;
        pending.root_ended |= is_root_end;
        inner.resident_spans += 1;

        self.enforce_cap(inner);
    }

    /// Release traces whose completion predicate fired by `now`.
    pub fn sweep_at(&self, now: Instant) -> Vec<Trace> {
        let quiet = self.config.quiet_interval;
        let max_age = self.config.max_age;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let ready: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, p)| {
                (p.root_ended && now.duration_since(p.last_arrival) >= quiet)
                    || now.duration_since(p.first_arrival) >= max_age
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut completed = Vec::with_capacity(ready.len());
        for trace_id in ready {
            if let Some(p) = inner.pending.remove(&trace_id) {
                inner.resident_spans -= p.trace.span_count();
                let quiet_fired = p.root_ended && now.duration_since(p.last_arrival) >= quiet;
                let mut trace = p.trace;
                if !quiet_fired {
                    trace.truncated = true;
                    counter!("betrace_traces_truncated").increment(1);
                    debug!(trace_id = %trace.trace_id, "trace hit max age, evaluating truncated");
                }
                completed.push(trace);
            }
        }
        let AssemblerInner {
            pending,
            arrival_order,
            ..
        } = inner;
        arrival_order.retain(|id| pending.contains_key(id));
        completed
    }

    /// Release traces whose completion predicate has fired.
    pub fn sweep(&self) -> Vec<Trace> {
        self.sweep_at(Instant::now())
    }

    /// Drain every resident trace, flagging as truncated those still inside
    /// their quiet interval. Used by shutdown.
    pub fn flush_all(&self) -> Vec<Trace> {
        let now = Instant::now();
        let quiet = self.config.quiet_interval;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut flushed = Vec::with_capacity(inner.pending.len());
        for (_, p) in inner.pending.drain() {
            let complete = p.root_ended && now.duration_since(p.last_arrival) >= quiet;
            let mut trace = p.trace;
            if !complete {
                trace.truncated = true;
                counter!("betrace_traces_truncated").increment(1);
            }
            flushed.push(trace);
        }
        inner.arrival_order.clear();
        inner.resident_spans = 0;
        flushed
    }

    /// Number of traces currently resident.
    pub fn pending_traces(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of spans currently resident.
    pub fn resident_spans(&self) -> usize {
        self.inner.lock().resident_spans
    }

    fn enforce_cap(&self, inner: &mut AssemblerInner) {
        while inner.resident_spans > self.config.max_resident_spans {
            let Some(oldest) = inner.arrival_order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.pending.remove(&oldest) {
                inner.resident_spans -= evicted.trace.span_count();
                counter!("betrace_traces_evicted").increment(1);
                warn!(
                    trace_id = %oldest,
                    spans = evicted.trace.span_count(),
                    "resident span cap reached, evicting oldest-arrived trace"
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
