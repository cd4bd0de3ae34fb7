use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicI64, AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
};

use metrics::{CounterFn, GaugeFn, Key};
use metrics_util::registry::{Registry as MetricsRegistry, Storage};
use parking_lot::RwLock;
use quanta::Clock;

use crate::{
    registry::{Metric, Registry},
    timer::Timer,
};

/// A monotonic count.
pub struct AtomicCounter {
    count: AtomicI64,
}

impl AtomicCounter {
    fn new() -> Self {
        Self { count: AtomicI64::new(0) }
    }

    /// Adds `delta` to the count.
    pub fn inc(&self, delta: i64) {
        self.count.fetch_add(delta, Relaxed);
    }

    /// Subtracts `delta` from the count.
    pub fn dec(&self, delta: i64) {
        self.count.fetch_sub(delta, Relaxed);
    }

    /// Returns the current count.
    pub fn count(&self) -> i64 {
        self.count.load(Acquire)
    }

    /// Resets the count to zero.
    pub fn clear(&self) {
        self.count.store(0, Release);
    }
}

impl CounterFn for AtomicCounter {
    fn increment(&self, value: u64) {
        self.inc(i64::try_from(value).unwrap_or(i64::MAX));
    }

    fn absolute(&self, value: u64) {
        self.count.store(i64::try_from(value).unwrap_or(i64::MAX), Release);
    }
}

/// An integer gauge.
pub struct AtomicGauge {
    value: AtomicI64,
}

impl AtomicGauge {
    fn new() -> Self {
        Self { value: AtomicI64::new(0) }
    }

    /// Sets the gauge.
    pub fn update(&self, value: i64) {
        self.value.store(value, Release);
    }

    /// Returns the current value.
    pub fn value(&self) -> i64 {
        self.value.load(Acquire)
    }
}

/// A floating-point gauge.
pub struct AtomicGaugeFloat {
    inner: AtomicU64,
}

impl AtomicGaugeFloat {
    fn new() -> Self {
        Self { inner: AtomicU64::new(0.0f64.to_bits()) }
    }

    /// Sets the gauge.
    pub fn update(&self, value: f64) {
        self.inner.store(value.to_bits(), Release);
    }

    /// Returns the current value.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.inner.load(Acquire))
    }

    fn apply<F>(&self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        // The closure always returns `Some`, so the update cannot fail.
        let _ = self
            .inner
            .fetch_update(AcqRel, Relaxed, |current| Some(f(f64::from_bits(current)).to_bits()));
    }
}

impl GaugeFn for AtomicGaugeFloat {
    fn increment(&self, value: f64) {
        self.apply(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.apply(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(value);
    }
}

/// Storage backing [`AtomicRegistry`].
///
/// Counters and gauges are plain atomics. Histograms become [`Timer`]s, which share the registry's clock.
pub(crate) struct StatsdStorage {
    clock: Clock,
}

impl Storage<Key> for StatsdStorage {
    type Counter = Arc<AtomicCounter>;
    type Gauge = Arc<AtomicGaugeFloat>;
    type Histogram = Arc<Timer>;

    fn counter(&self, _: &Key) -> Self::Counter {
        Arc::new(AtomicCounter::new())
    }

    fn gauge(&self, _: &Key) -> Self::Gauge {
        Arc::new(AtomicGaugeFloat::new())
    }

    fn histogram(&self, _: &Key) -> Self::Histogram {
        Arc::new(Timer::new(self.clock.clone()))
    }
}

struct Inner {
    metrics: MetricsRegistry<Key, StatsdStorage>,
    int_gauges: RwLock<HashMap<Key, Arc<AtomicGauge>>>,
}

/// A thread-safe, in-memory registry of counters, gauges and timers.
///
/// Cloning the registry is cheap and every clone shares the same metrics. Metrics are created on first use and live as
/// long as the registry does.
///
/// Metrics registered through [`StatsdRecorder`][crate::StatsdRecorder] may carry labels: they are exported under their
/// name followed by `.<label key>.<label value>` for each label.
///
/// Integer and floating-point gauges live in separate namespaces. Registering both kinds under one name yields two
/// distinct metrics, and both are exported under `<name>.value`, so each export sends two lines for that key. Give
/// gauges of different kinds different names.
#[derive(Clone)]
pub struct AtomicRegistry {
    inner: Arc<Inner>,
}

impl AtomicRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Creates an empty registry whose timers measure rates against the given clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(Inner {
                metrics: MetricsRegistry::new(StatsdStorage { clock }),
                int_gauges: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry<Key, StatsdStorage> {
        &self.inner.metrics
    }

    /// Gets or creates the counter with the given name.
    pub fn counter(&self, name: &str) -> Arc<AtomicCounter> {
        self.metrics().get_or_create_counter(&Key::from_name(name.to_owned()), Arc::clone)
    }

    /// Gets or creates the integer gauge with the given name.
    ///
    /// This never returns the floating-point gauge of the same name: see [`AtomicRegistry`] for how the two are exported.
    pub fn gauge(&self, name: &str) -> Arc<AtomicGauge> {
        let key = Key::from_name(name.to_owned());
        if let Some(gauge) = self.inner.int_gauges.read().get(&key) {
            return Arc::clone(gauge);
        }

        let mut gauges = self.inner.int_gauges.write();
        Arc::clone(gauges.entry(key).or_insert_with(|| Arc::new(AtomicGauge::new())))
    }

    /// Gets or creates the floating-point gauge with the given name.
    ///
    /// This never returns the integer gauge of the same name: see [`AtomicRegistry`] for how the two are exported.
    pub fn gauge_float(&self, name: &str) -> Arc<AtomicGaugeFloat> {
        self.metrics().get_or_create_gauge(&Key::from_name(name.to_owned()), Arc::clone)
    }

    /// Gets or creates the timer with the given name.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.metrics().get_or_create_histogram(&Key::from_name(name.to_owned()), Arc::clone)
    }
}

impl Default for AtomicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for AtomicRegistry {
    fn entries(&self) -> impl Iterator<Item = (String, Metric)> + '_ {
        let mut entries = Vec::new();

        self.metrics().visit_counters(|key, counter| {
            entries.push((entry_name(key), Metric::Counter(counter.count())));
        });
        self.metrics().visit_gauges(|key, gauge| {
            entries.push((entry_name(key), Metric::GaugeFloat64(gauge.value())));
        });
        for (key, gauge) in self.inner.int_gauges.read().iter() {
            entries.push((entry_name(key), Metric::Gauge(gauge.value())));
        }
        self.metrics().visit_histograms(|key, timer| {
            entries.push((entry_name(key), Metric::Timer(Box::new(timer.snapshot()))));
        });

        entries.into_iter()
    }
}

fn entry_name(key: &Key) -> String {
    let mut name = key.name().to_owned();
    for label in key.labels() {
        name.push('.');
        name.push_str(label.key());
        name.push('.');
        name.push_str(label.value());
    }
    name
}

#[cfg(test)]
mod tests {
    use metrics::{CounterFn as _, GaugeFn as _, Key, Label};

    use super::{entry_name, AtomicCounter, AtomicGaugeFloat, AtomicRegistry};
    use crate::registry::{Metric, Registry as _};

    #[test]
    fn atomic_counter() {
        let counter = AtomicCounter::new();
        assert_eq!(counter.count(), 0);

        counter.inc(42);
        counter.dec(2);
        assert_eq!(counter.count(), 40);

        counter.increment(2);
        assert_eq!(counter.count(), 42);

        counter.absolute(7);
        assert_eq!(counter.count(), 7);

        counter.clear();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn atomic_gauge_float() {
        let gauge = AtomicGaugeFloat::new();
        assert_eq!(gauge.value(), 0.0);

        gauge.increment(42.0);
        gauge.increment(13.0);
        assert_eq!(gauge.value(), 55.0);

        gauge.decrement(60.0);
        assert_eq!(gauge.value(), -5.0);

        gauge.set(1.5);
        assert_eq!(gauge.value(), 1.5);
    }

    #[test]
    fn handles_are_shared() {
        let registry = AtomicRegistry::new();
        registry.counter("requests").inc(1);
        registry.clone().counter("requests").inc(2);
        registry.gauge("depth").update(3);
        registry.gauge("depth").update(4);

        assert_eq!(registry.counter("requests").count(), 3);
        assert_eq!(registry.gauge("depth").value(), 4);
    }

    #[test]
    fn entries_cover_every_metric_once() {
        let registry = AtomicRegistry::new();
        registry.counter("requests").inc(5);
        registry.gauge("depth").update(-3);
        registry.gauge_float("load").update(0.25);
        registry.timer("latency").update_nanos(1_000);

        let mut seen = registry
            .entries()
            .map(|(name, metric)| {
                let rendered = match metric {
                    Metric::Counter(count) => format!("counter {count}"),
                    Metric::Gauge(value) => format!("gauge {value}"),
                    Metric::GaugeFloat64(value) => format!("gauge_float {value}"),
                    Metric::Timer(snapshot) => format!("timer {}", snapshot.count()),
                };
                format!("{name}: {rendered}")
            })
            .collect::<Vec<_>>();
        seen.sort();

        assert_eq!(
            seen,
            vec![
                "depth: gauge -3".to_string(),
                "latency: timer 1".to_string(),
                "load: gauge_float 0.25".to_string(),
                "requests: counter 5".to_string(),
            ]
        );

        // Restartable: a second pass sees the same metrics.
        assert_eq!(registry.entries().count(), 4);
    }

    #[test]
    fn gauge_kinds_are_exported_separately() {
        let registry = AtomicRegistry::new();
        registry.gauge("load").update(3);
        registry.gauge_float("load").update(0.5);

        assert_eq!(registry.gauge("load").value(), 3);
        assert_eq!(registry.gauge_float("load").value(), 0.5);

        let mut seen = registry
            .entries()
            .map(|(name, metric)| match metric {
                Metric::Gauge(value) => format!("{name}: gauge {value}"),
                Metric::GaugeFloat64(value) => format!("{name}: gauge_float {value}"),
                _ => panic!("unexpected metric {name}"),
            })
            .collect::<Vec<_>>();
        seen.sort();

        assert_eq!(seen, vec!["load: gauge 3".to_string(), "load: gauge_float 0.5".to_string()]);
    }

    #[test]
    fn labels_are_flattened_into_names() {
        let key = Key::from_parts("http_requests", vec![Label::new("method", "get"), Label::new("code", "200")]);
        assert_eq!(entry_name(&key), "http_requests.method.get.code.200");
        assert_eq!(entry_name(&Key::from_name("plain")), "plain");
    }
}
