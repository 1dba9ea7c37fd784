use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::{resources::RKEBootstrap, Error};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub deferrals: IntCounterVec,
    pub etcd_safety_checks: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "rke_bootstrap_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "rke_bootstrap_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("rke_bootstrap_reconciliations_total", "reconciliations").unwrap();
        let deferrals = IntCounterVec::new(
            opts!(
                "rke_bootstrap_deferrals_total",
                "reconciliations postponed while waiting on a dependency"
            ),
            &["reason"],
        )
        .unwrap();
        let etcd_safety_checks = IntCounterVec::new(
            opts!(
                "rke_bootstrap_etcd_safety_checks_total",
                "etcd member removal safety checks"
            ),
            &["result"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            deferrals,
            etcd_safety_checks,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.deferrals.clone()))?;
        registry.register(Box::new(self.etcd_safety_checks.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, bootstrap: &RKEBootstrap, e: &Error) {
        self.failures
            .with_label_values(&[bootstrap.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn deferred(&self, reason: &str) {
        self.deferrals.with_label_values(&[reason]).inc()
    }

    pub fn etcd_safety_check(&self, safe: bool) {
        let result = if safe { "safe" } else { "unsafe" };
        self.etcd_safety_checks.with_label_values(&[result]).inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}
