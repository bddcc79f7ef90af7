//! Worker pool bounding concurrent batch evaluations with a tokio Semaphore.
//!
//! Each worker owns one in-flight trace end-to-end; workers share nothing
//! mutable with each other beyond the registry, the expression cache, the
//! signer, and the audit counters, which are all guarded for read-mostly use.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{BeTraceError, Result};

/// Configuration for the evaluation worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Timeout for acquiring a worker permit (milliseconds)
    pub acquire_timeout_ms: u64,
    /// Name for this pool (for logging)
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            acquire_timeout_ms: 30_000,
            name: "evaluation".to_string(),
        }
    }
}

/// Internal statistics tracking.
struct PoolStats {
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    peak_concurrent: AtomicUsize,
    current_concurrent: AtomicUsize,
    acquire_timeouts: AtomicU64,
}

impl PoolStats {
    fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            peak_concurrent: AtomicUsize::new(0),
            current_concurrent: AtomicUsize::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }
}

/// A permit that returns to the pool when dropped.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    completed: bool,
}

impl WorkerPermit {
    pub fn mark_success(mut self) {
        self.completed = true;
        self.stats.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.stats.current_concurrent.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mark_failure(mut self) {
        self.completed = true;
        self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.current_concurrent.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        if !self.completed {
            self.stats.current_concurrent.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Semaphore-bounded pool of evaluation workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));

        tracing::info!(
            pool_name = %config.name,
            max_workers = config.max_workers,
            "worker pool created"
        );

        Self {
            config,
            semaphore,
            stats: Arc::new(PoolStats::new()),
            created_at: Instant::now(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.semaphore.available_permits()
    }

    /// Acquire a worker permit, waiting up to the configured timeout.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);

        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                self.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pool_name = %self.config.name,
                    timeout_ms = self.config.acquire_timeout_ms,
                    "worker permit acquire timed out"
                );
                BeTraceError::internal(format!(
                    "worker pool '{}' acquire timeout after {}ms",
                    self.config.name, self.config.acquire_timeout_ms
                ))
            })?
            .map_err(|_| {
                BeTraceError::internal(format!(
                    "worker pool '{}' semaphore closed",
                    self.config.name
                ))
            })?;

        let current = self.stats.current_concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak_concurrent.fetch_max(current, Ordering::Relaxed);

        Ok(WorkerPermit {
            _permit: permit,
            stats: self.stats.clone(),
            completed: false,
        })
    }

    /// Snapshot of pool statistics for the health endpoint.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            active_workers: self.active_workers(),
            tasks_submitted: self.stats.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.stats.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.stats.tasks_failed.load(Ordering::Relaxed),
            acquire_timeouts: self.stats.acquire_timeouts.load(Ordering::Relaxed),
            peak_concurrent: self.stats.peak_concurrent.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Public statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerPoolStats {
    pub name: String,
    pub max_workers: usize,
    pub active_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub acquire_timeouts: u64,
    pub peak_concurrent: usize,
    pub uptime_secs: u64,
}
