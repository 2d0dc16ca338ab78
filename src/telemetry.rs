//! Structured logging helpers and in-process metrics.
//!
//! `veritas-core` does not export an HTTP metrics endpoint (the HTTP
//! surface is an external concern); instead components bump counters on a
//! shared [`Metrics`] handle that a caller can snapshot and export however
//! it likes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// A single named counter, safe to share across tasks.
#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lightweight in-process counters, cloneable and cheap to share.
///
/// Mirrors the shape of the teacher's Prometheus counters
/// (`memory_hits`/`redis_hits`/`redis_misses` style atomics) without
/// requiring a Prometheus registry or HTTP server, since exporting metrics
/// over HTTP is outside this crate's scope.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<DashMap<&'static str, Counter>>,
}

impl Metrics {
    /// Create an empty set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the named counter, creating it at zero first if needed.
    pub fn incr(&self, name: &'static str) {
        self.counters.entry(name).or_default().incr();
    }

    /// Read the current value of a counter (0 if never incremented).
    pub fn get(&self, name: &'static str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Take a point-in-time snapshot of every counter touched so far.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().get()))
            .collect()
    }
}

/// Counter names used by components in this crate. Kept centralized so a
/// caller inspecting a [`Metrics`] snapshot has one place to look up what a
/// key means.
pub mod counters {
    /// A step was dispatched to a handler.
    pub const STEPS_RUN: &str = "steps_run";
    /// A step was retried after a transient failure.
    pub const RETRIES_ISSUED: &str = "retries_issued";
    /// The quality gate approved a result.
    pub const QUALITY_APPROVED: &str = "quality_approved";
    /// The quality gate requested a retry.
    pub const QUALITY_RETRIED: &str = "quality_retried";
    /// The quality gate escalated to human review.
    pub const QUALITY_REVIEW_REQUESTED: &str = "quality_review_requested";
    /// A Reciprocal Rank Fusion pass was performed.
    pub const RRF_FUSIONS: &str = "rrf_fusions";
    /// A checkpoint was written.
    pub const CHECKPOINTS_WRITTEN: &str = "checkpoints_written";
    /// A checkpoint was restored.
    pub const CHECKPOINTS_RESTORED: &str = "checkpoints_restored";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_snapshots() {
        let metrics = Metrics::new();
        metrics.incr(counters::STEPS_RUN);
        metrics.incr(counters::STEPS_RUN);
        metrics.incr(counters::RETRIES_ISSUED);
        assert_eq!(metrics.get(counters::STEPS_RUN), 2);
        assert_eq!(metrics.get(counters::RETRIES_ISSUED), 1);
        assert_eq!(metrics.get("never_touched"), 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.get(counters::STEPS_RUN), Some(&2));
    }
}
