//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//! Every ledger owns its own [`Registry`], so several ledgers can live in
//! one process.
//!
//! # Metrics
//!
//! - `wallet_ledger_posts_total` - Transactions applied
//! - `wallet_ledger_idempotent_replays_total` - Requests answered from an existing key
//! - `wallet_ledger_version_conflicts_total` - Optimistic-lock conflicts (retried)
//! - `wallet_ledger_concurrency_exhausted_total` - Requests that ran out of retries
//! - `wallet_ledger_insufficient_balance_total` - Debits rejected by the balance floor
//! - `wallet_ledger_catch_all_writes_total` - Writes routed to `tx_default`
//! - `wallet_ledger_partitions_created_total` - Partitions provisioned
//! - `wallet_ledger_post_duration_seconds` - Histogram of post latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transactions applied
    pub posts_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Version conflicts seen by the retry loop
    pub version_conflicts_total: IntCounter,

    /// Retry budgets exhausted
    pub concurrency_exhausted_total: IntCounter,

    /// Insufficient-balance rejections
    pub insufficient_balance_total: IntCounter,

    /// Catch-all partition writes
    pub catch_all_writes_total: IntCounter,

    /// Partitions created
    pub partitions_created_total: IntCounter,

    /// Post duration histogram
    pub post_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let posts_total = counter("wallet_ledger_posts_total", "Transactions applied")?;
        let replays_total = counter(
            "wallet_ledger_idempotent_replays_total",
            "Requests answered from an existing idempotency key",
        )?;
        let version_conflicts_total = counter(
            "wallet_ledger_version_conflicts_total",
            "Optimistic-lock conflicts",
        )?;
        let concurrency_exhausted_total = counter(
            "wallet_ledger_concurrency_exhausted_total",
            "Requests that exhausted their retry budget",
        )?;
        let insufficient_balance_total = counter(
            "wallet_ledger_insufficient_balance_total",
            "Debits rejected by the balance floor",
        )?;
        let catch_all_writes_total = counter(
            "wallet_ledger_catch_all_writes_total",
            "Transactions routed to the catch-all partition",
        )?;
        let partitions_created_total = counter(
            "wallet_ledger_partitions_created_total",
            "Transaction partitions provisioned",
        )?;

        let post_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_ledger_post_duration_seconds",
                "Histogram of post latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(post_duration.clone()))?;

        Ok(Self {
            posts_total,
            replays_total,
            version_conflicts_total,
            concurrency_exhausted_total,
            insufficient_balance_total,
            catch_all_writes_total,
            partitions_created_total,
            post_duration,
            registry,
        })
    }

    /// Record an applied transaction
    pub fn record_post(&self, duration_seconds: f64) {
        self.posts_total.inc();
        self.post_duration.observe(duration_seconds);
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record a version conflict
    pub fn record_version_conflict(&self) {
        self.version_conflicts_total.inc();
    }

    /// Record an exhausted retry budget
    pub fn record_concurrency_exhausted(&self) {
        self.concurrency_exhausted_total.inc();
    }

    /// Record an insufficient-balance rejection
    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance_total.inc();
    }

    /// Record a catch-all partition write
    pub fn record_catch_all_write(&self) {
        self.catch_all_writes_total.inc();
    }

    /// Record newly provisioned partitions
    pub fn record_partitions_created(&self, count: usize) {
        self.partitions_created_total.inc_by(count as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("posts_total", &self.posts_total.get())
            .field("replays_total", &self.replays_total.get())
            .field("version_conflicts_total", &self.version_conflicts_total.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.posts_total.get(), 0);
        assert_eq!(metrics.catch_all_writes_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_post(0.002);
        assert_eq!(first.posts_total.get(), 1);
        assert_eq!(second.posts_total.get(), 0);
    }

    #[test]
    fn test_record_partitions_created() {
        let metrics = Metrics::new().unwrap();
        metrics.record_partitions_created(4);
        metrics.record_partitions_created(0);
        assert_eq!(metrics.partitions_created_total.get(), 4);
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_replay();
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "wallet_ledger_idempotent_replays_total"));
        assert_eq!(families.len(), 8);
    }
}
