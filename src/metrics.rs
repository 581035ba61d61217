use crate::resources::core::Condition;
use crate::Error;
use kube::ResourceExt;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    /// 1 for the current status of each condition, 0 for the others
    pub conditions: IntGaugeVec,
}

const CONDITION_STATUSES: &[&str] = &["True", "False", "Unknown", "Progressing"];

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "gardenlet_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 120., 300.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "gardenlet_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("gardenlet_reconciliations_total", "reconciliations").unwrap();
        let conditions = IntGaugeVec::new(
            opts!("gardenlet_condition", "status of the conditions maintained by gardenlet"),
            &["kind", "instance", "type", "status"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            conditions,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.conditions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, obj: &T, e: &Error) {
        self.failures
            .with_label_values(&[T::kind(&()).as_ref(), obj.name_any().as_ref(), e.metric_label()])
            .inc()
    }

    pub fn observe_conditions<T: kube::Resource<DynamicType = ()>>(
        &self,
        obj: &T,
        conditions: &[Condition],
    ) {
        let kind = T::kind(&());
        let name = obj.name_any();
        for condition in conditions {
            for status in CONDITION_STATUSES {
                self.conditions
                    .with_label_values(&[kind.as_ref(), name.as_str(), condition.r#type.as_str(), *status])
                    .set(i64::from(condition.status == *status));
            }
        }
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}
