use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

use crate::storage::AtomicRegistry;

/// A recorder that stores metrics in an [`AtomicRegistry`] for a [`StatsdExporter`][crate::StatsdExporter] to report.
///
/// Counters map to registry counters, gauges to floating-point gauges, and histograms to timers. Histogram values are
/// interpreted as seconds, which is how `metrics` records a [`Duration`][std::time::Duration].
pub struct StatsdRecorder {
    registry: AtomicRegistry,
}

impl StatsdRecorder {
    /// Creates a recorder that writes into the given registry.
    pub fn new(registry: AtomicRegistry) -> Self {
        StatsdRecorder { registry }
    }

    /// Returns the registry this recorder writes into.
    pub fn registry(&self) -> &AtomicRegistry {
        &self.registry
    }
}

impl Recorder for StatsdRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .metrics()
            .get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry
            .metrics()
            .get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .metrics()
            .get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label, Recorder as _};

    use super::StatsdRecorder;
    use crate::{
        registry::{Metric, Registry as _},
        storage::AtomicRegistry,
    };

    static METADATA: metrics::Metadata =
        metrics::Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()));

    #[test]
    fn recorded_metrics_reach_the_registry() {
        let recorder = StatsdRecorder::new(AtomicRegistry::new());

        let counter = recorder.register_counter(&Key::from_name("requests"), &METADATA);
        counter.increment(2);
        counter.increment(3);

        let key = Key::from_parts("load", vec![Label::new("host", "a")]);
        let gauge = recorder.register_gauge(&key, &METADATA);
        gauge.set(4.0);
        gauge.decrement(1.5);

        let histogram = recorder.register_histogram(&Key::from_name("latency"), &METADATA);
        histogram.record(0.25);

        let mut entries = recorder.registry().entries().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 3);

        match &entries[0] {
            (name, Metric::Timer(snapshot)) => {
                assert_eq!(name, "latency");
                assert_eq!(snapshot.count(), 1);
                assert_eq!(snapshot.max(), 250_000_000);
            }
            _ => panic!("expected a timer"),
        }
        match &entries[1] {
            (name, Metric::GaugeFloat64(value)) => {
                assert_eq!(name, "load.host.a");
                assert_eq!(*value, 2.5);
            }
            _ => panic!("expected a floating-point gauge"),
        }
        match &entries[2] {
            (name, Metric::Counter(count)) => {
                assert_eq!(name, "requests");
                assert_eq!(*count, 5);
            }
            _ => panic!("expected a counter"),
        }
    }

    #[test]
    fn registry_handles_and_recorder_share_metrics() {
        let registry = AtomicRegistry::new();
        let recorder = StatsdRecorder::new(registry.clone());

        registry.counter("jobs").inc(1);
        recorder.register_counter(&Key::from_name("jobs"), &METADATA).increment(1);

        assert_eq!(registry.counter("jobs").count(), 2);
    }
}
