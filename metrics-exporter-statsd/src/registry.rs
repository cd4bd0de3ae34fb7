use std::sync::Arc;

/// Point-in-time statistics of a timer.
///
/// Durations are expressed in the timer's internal unit, which is nanoseconds for timers held by
/// [`AtomicRegistry`][crate::AtomicRegistry]. Rates are events per second.
pub trait TimerSnapshot {
    /// Total number of recorded events.
    fn count(&self) -> i64;

    /// Smallest observed duration.
    fn min(&self) -> i64;

    /// Largest observed duration.
    fn max(&self) -> i64;

    /// Arithmetic mean of the observed durations.
    fn mean(&self) -> f64;

    /// Standard deviation of the observed durations.
    fn std_dev(&self) -> f64;

    /// Returns the duration at each of the given quantiles, in the same order.
    ///
    /// Quantiles are expressed in the range `[0, 1]`.
    fn percentiles(&self, quantiles: &[f64]) -> Vec<f64>;

    /// One-minute exponentially-weighted moving average rate.
    fn rate1(&self) -> f64;

    /// Five-minute exponentially-weighted moving average rate.
    fn rate5(&self) -> f64;

    /// Fifteen-minute exponentially-weighted moving average rate.
    fn rate15(&self) -> f64;

    /// Mean rate since the timer was created.
    fn rate_mean(&self) -> f64;
}

/// The current value of a single metric.
pub enum Metric {
    /// Monotonic count.
    Counter(i64),

    /// Integer gauge.
    Gauge(i64),

    /// Floating-point gauge.
    GaugeFloat64(f64),

    /// Statistical snapshot of a timer.
    Timer(Box<dyn TimerSnapshot>),
}

/// A source of metrics to export.
///
/// Every call to [`entries`][Registry::entries] yields a fresh, finite sequence of `(name, metric)` pairs. Each metric
/// must appear exactly once per call; ordering is up to the implementation.
///
/// Implementations are read concurrently with whatever is recording into them, and must tolerate that.
pub trait Registry {
    /// Returns the current value of every metric in the registry.
    fn entries(&self) -> impl Iterator<Item = (String, Metric)> + '_;
}

impl<R> Registry for &R
where
    R: Registry + ?Sized,
{
    fn entries(&self) -> impl Iterator<Item = (String, Metric)> + '_ {
        (**self).entries()
    }
}

impl<R> Registry for Arc<R>
where
    R: Registry + ?Sized,
{
    fn entries(&self) -> impl Iterator<Item = (String, Metric)> + '_ {
        (**self).entries()
    }
}
