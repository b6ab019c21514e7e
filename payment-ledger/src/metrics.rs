//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `webhooks_admitted_total` - Deliveries admitted for side-effect execution
//! - `webhooks_duplicate_total` - Deliveries suppressed as duplicates
//! - `webhooks_dead_lettered_total` - Deliveries past the attempt bound
//! - `quota_rejections_total` - Unlock reservations rejected at the daily limit
//! - `entitlements_granted_total` - New entitlement rows created
//! - `escrow_released_total` - Escrow holds released by the sweep
//! - `sweep_duration_seconds` - Histogram of sweep durations

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Deliveries admitted for execution
    pub webhooks_admitted: IntCounter,

    /// Deliveries suppressed as duplicates (already processed or in flight)
    pub webhooks_duplicate: IntCounter,

    /// Deliveries routed to the dead-letter path
    pub webhooks_dead_lettered: IntCounter,

    /// Reservations rejected at the daily quota
    pub quota_rejections: IntCounter,

    /// New entitlements created
    pub entitlements_granted: IntCounter,

    /// Escrow holds released
    pub escrow_released: IntCounter,

    /// Sweep duration histogram
    pub sweep_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let webhooks_admitted = IntCounter::with_opts(Opts::new(
            "webhooks_admitted_total",
            "Deliveries admitted for side-effect execution",
        ))?;
        registry.register(Box::new(webhooks_admitted.clone()))?;

        let webhooks_duplicate = IntCounter::with_opts(Opts::new(
            "webhooks_duplicate_total",
            "Deliveries suppressed as duplicates",
        ))?;
        registry.register(Box::new(webhooks_duplicate.clone()))?;

        let webhooks_dead_lettered = IntCounter::with_opts(Opts::new(
            "webhooks_dead_lettered_total",
            "Deliveries past the attempt bound",
        ))?;
        registry.register(Box::new(webhooks_dead_lettered.clone()))?;

        let quota_rejections = IntCounter::with_opts(Opts::new(
            "quota_rejections_total",
            "Unlock reservations rejected at the daily limit",
        ))?;
        registry.register(Box::new(quota_rejections.clone()))?;

        let entitlements_granted = IntCounter::with_opts(Opts::new(
            "entitlements_granted_total",
            "New entitlement rows created",
        ))?;
        registry.register(Box::new(entitlements_granted.clone()))?;

        let escrow_released = IntCounter::with_opts(Opts::new(
            "escrow_released_total",
            "Escrow holds released by the sweep",
        ))?;
        registry.register(Box::new(escrow_released.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new("sweep_duration_seconds", "Histogram of sweep durations")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            webhooks_admitted,
            webhooks_duplicate,
            webhooks_dead_lettered,
            quota_rejections,
            entitlements_granted,
            escrow_released,
            sweep_duration,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.webhooks_admitted.get(), 0);
        assert_eq!(metrics.escrow_released.get(), 0);
    }

    #[test]
    fn test_counters_increment() {
        let metrics = Metrics::new().unwrap();
        metrics.webhooks_admitted.inc();
        metrics.webhooks_duplicate.inc();
        metrics.webhooks_duplicate.inc();

        assert_eq!(metrics.webhooks_admitted.get(), 1);
        assert_eq!(metrics.webhooks_duplicate.get(), 2);
    }
}
