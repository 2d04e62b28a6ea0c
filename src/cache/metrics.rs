//! Cache Metrics Collection
//!
//! Per-cache Prometheus counters and gauges, registered in a registry owned
//! by the cache rather than the process-wide default one. Every metric
//! carries a constant `entity` label.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::Result;

/// Point-in-time copy of the metric values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub invalidations: u64,
    pub overlaps_reported: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub retries: u64,
    pub snapshots: i64,
    pub identities: i64,
}

impl MetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache metrics collector
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    puts: IntCounter,
    removes: IntCounter,
    invalidations: IntCounter,
    overlaps_reported: IntCounter,
    commits: IntCounter,
    rollbacks: IntCounter,
    retries: IntCounter,
    snapshots: IntGauge,
    identities: IntGauge,
}

impl CacheMetrics {
    /// Create and register the metrics for one entity
    pub fn new(entity: &str) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).const_label("entity", entity))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).const_label("entity", entity))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let metrics = Self {
            hits: counter("bitemporal_cache_hits_total", "Point lookups answered from cache")?,
            misses: counter("bitemporal_cache_misses_total", "Point lookups with no match")?,
            puts: counter("bitemporal_cache_puts_total", "Snapshots added")?,
            removes: counter("bitemporal_cache_removes_total", "Snapshots removed or purged")?,
            invalidations: counter(
                "bitemporal_cache_invalidations_total",
                "Identities dropped by invalidation",
            )?,
            overlaps_reported: counter(
                "bitemporal_cache_overlaps_reported_total",
                "Overlapping snapshot pairs reported by scans",
            )?,
            commits: counter("bitemporal_cache_commits_total", "Transactions committed")?,
            rollbacks: counter("bitemporal_cache_rollbacks_total", "Transactions rolled back")?,
            retries: counter("bitemporal_cache_retries_total", "Unit-of-work re-executions")?,
            snapshots: gauge("bitemporal_cache_snapshots", "Snapshots held")?,
            identities: gauge("bitemporal_cache_identities", "Distinct identities held")?,
            registry,
        };
        Ok(metrics)
    }

    pub fn record_hit(&self) {
        self.hits.inc();
    }

    pub fn record_miss(&self) {
        self.misses.inc();
    }

    pub fn record_puts(&self, n: usize) {
        self.puts.inc_by(n as u64);
    }

    pub fn record_removes(&self, n: usize) {
        self.removes.inc_by(n as u64);
    }

    pub fn record_invalidations(&self, n: usize) {
        self.invalidations.inc_by(n as u64);
    }

    pub fn record_overlaps(&self, pairs: usize) {
        self.overlaps_reported.inc_by(pairs as u64);
    }

    pub fn record_commit(&self) {
        self.commits.inc();
    }

    pub fn record_rollback(&self) {
        self.rollbacks.inc();
    }

    pub fn record_retry(&self) {
        self.retries.inc();
    }

    /// Refresh the size gauges
    pub fn update_sizes(&self, snapshots: usize, identities: usize) {
        self.snapshots.set(snapshots as i64);
        self.identities.set(identities as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            puts: self.puts.get(),
            removes: self.removes.get(),
            invalidations: self.invalidations.get(),
            overlaps_reported: self.overlaps_reported.get(),
            commits: self.commits.get(),
            rollbacks: self.rollbacks.get(),
            retries: self.retries.get(),
            snapshots: self.snapshots.get(),
            identities: self.identities.get(),
        }
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::error::Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("values", &self.snapshot())
            .finish()
    }
}
