//! Prometheus metrics (spec C7), shaped after the teacher's `Metrics`
//! (`reconciliations`, `failures`, `reconcile_duration` + the
//! `Drop`-based `ReconcileMeasurer`), extended with the counters and
//! latency histograms this controller's SC lifecycle needs.

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub quota_errors: IntCounter,
    pub backend_errors: IntCounter,
    pub creation_latency: HistogramVec,
    pub binding_latency: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "mcrt_reconcile_duration_seconds",
                "Duration of a single reconcile pass in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("mcrt_reconciliation_errors_total", "reconciliation errors"),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new("mcrt_reconciliations_total", "reconciliations").unwrap();
        let quota_errors = IntCounter::new(
            "mcrt_quota_exceeded_total",
            "SslCertificate creations rejected by the cloud backend for exceeding quota",
        )
        .unwrap();
        let backend_errors = IntCounter::new(
            "mcrt_backend_errors_total",
            "Non-quota errors returned by the cloud SslCertificate backend",
        )
        .unwrap();
        let creation_latency = HistogramVec::new(
            histogram_opts!(
                "mcrt_ssl_certificate_creation_latency_seconds",
                "Time between ManagedCertificate creation and its SslCertificate first appearing",
            )
            .buckets(vec![1., 5., 15., 60., 300., 900., 3600.]),
            &["instance"],
        )
        .unwrap();
        let binding_latency = HistogramVec::new(
            histogram_opts!(
                "mcrt_ssl_certificate_binding_latency_seconds",
                "Time between ManagedCertificate creation and its SslCertificate being bound to an ingress",
            )
            .buckets(vec![1., 5., 15., 60., 300., 900., 3600.]),
            &["instance"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            quota_errors,
            backend_errors,
            creation_latency,
            binding_latency,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.quota_errors.clone()))?;
        registry.register(Box::new(self.backend_errors.clone()))?;
        registry.register(Box::new(self.creation_latency.clone()))?;
        registry.register(Box::new(self.binding_latency.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, instance: &str, error: &crate::errors::Error) {
        self.failures.with_label_values(&[instance, error.metric_label().as_str()]).inc();
    }

    pub fn count_and_measure(&self, instance: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: instance.to_string(),
        }
    }

    pub fn record_quota_error(&self) {
        self.quota_errors.inc();
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.inc();
    }

    /// Records `seconds` into the creation-latency histogram, unless the
    /// caller has already determined the observation shouldn't count
    /// (`excluded_from_slo` or already-reported — those checks live in the
    /// Synchronizer, which decides whether to call this at all).
    pub fn observe_creation_latency(&self, instance: &str, seconds: f64) {
        self.creation_latency.with_label_values(&[instance]).observe(seconds);
    }

    pub fn observe_binding_latency(&self, instance: &str, seconds: f64) {
        self.binding_latency.with_label_values(&[instance]).observe(seconds);
    }
}

/// Relies on `Drop` to calculate duration and register the observation in
/// the histogram, so a reconcile that returns early (via `?`) is still
/// timed.
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.instance.as_str()]).observe(duration);
    }
}
