use std::time::Duration;

use metrics::HistogramFn;
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use rand::{Rng as _, SeedableRng as _};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::registry::TimerSnapshot;

const RESERVOIR_SIZE: usize = 1028;
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Exponentially-weighted moving average of an event rate, updated once per tick.
struct Ewma {
    alpha: f64,
    rate: f64,
    uncounted: i64,
    initialized: bool,
}

impl Ewma {
    fn new(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            uncounted: 0,
            initialized: false,
        }
    }

    fn update(&mut self, n: i64) {
        self.uncounted += n;
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;

        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

struct Meter {
    count: i64,
    rates: [Ewma; 3],
    start: Instant,
    last_tick: Instant,
}

impl Meter {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            rates: [Ewma::new(1.0), Ewma::new(5.0), Ewma::new(15.0)],
            start: now,
            last_tick: now,
        }
    }

    fn mark(&mut self, now: Instant, n: i64) {
        self.tick_if_necessary(now);
        self.count += n;
        for rate in &mut self.rates {
            rate.update(n);
        }
    }

    /// Catches the moving averages up on every whole tick that has elapsed since the last one.
    fn tick_if_necessary(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ticks = elapsed.as_nanos() / TICK_INTERVAL.as_nanos();
        if ticks == 0 {
            return;
        }

        let remainder = elapsed.as_nanos() % TICK_INTERVAL.as_nanos();
        self.last_tick = now - Duration::from_nanos(remainder as u64);

        for _ in 0..ticks {
            for rate in &mut self.rates {
                rate.tick();
            }
        }
    }

    fn rate_mean(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Uniform reservoir sample (Vitter's algorithm R) over every recorded value.
struct UniformSample {
    count: i64,
    values: Vec<i64>,
    rng: Xoshiro256PlusPlus,
}

impl UniformSample {
    fn new() -> Self {
        Self {
            count: 0,
            values: Vec::with_capacity(RESERVOIR_SIZE),
            rng: Xoshiro256PlusPlus::from_rng(&mut rand::rng()),
        }
    }

    fn update(&mut self, value: i64) {
        self.count += 1;
        if self.values.len() < RESERVOIR_SIZE {
            self.values.push(value);
            return;
        }

        let slot = self.rng.random_range(0..self.count);
        if let Some(existing) = usize::try_from(slot).ok().and_then(|slot| self.values.get_mut(slot)) {
            *existing = value;
        }
    }
}

struct TimerState {
    sample: UniformSample,
    meter: Meter,
}

/// A timer: a sampled distribution of durations along with the rate at which they are recorded.
///
/// Durations are stored in nanoseconds. The one, five and fifteen-minute rates are exponentially-weighted moving
/// averages updated every five seconds.
pub struct Timer {
    clock: Clock,
    state: Mutex<TimerState>,
}

impl Timer {
    pub(crate) fn new(clock: Clock) -> Self {
        let now = clock.now();
        Self {
            clock,
            state: Mutex::new(TimerState { sample: UniformSample::new(), meter: Meter::new(now) }),
        }
    }

    /// Records a duration.
    pub fn update(&self, duration: Duration) {
        self.update_nanos(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX));
    }

    /// Records a duration given in nanoseconds.
    pub fn update_nanos(&self, nanos: i64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.sample.update(nanos);
        state.meter.mark(now, 1);
    }

    /// Runs `f` and records how long it took.
    pub fn time<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = self.clock.now();
        let result = f();
        self.update(self.clock.now().saturating_duration_since(start));
        result
    }

    /// Takes a snapshot of the timer's current statistics.
    pub fn snapshot(&self) -> TimerSnapshotData {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.meter.tick_if_necessary(now);

        let mut values = state.sample.values.clone();
        values.sort_unstable();

        let [rate1, rate5, rate15] = &state.meter.rates;
        TimerSnapshotData {
            count: state.sample.count,
            values,
            rate1: rate1.rate,
            rate5: rate5.rate,
            rate15: rate15.rate,
            rate_mean: state.meter.rate_mean(now),
        }
    }
}

impl HistogramFn for Timer {
    /// Records a value given in seconds, as `metrics` does for durations.
    fn record(&self, value: f64) {
        self.update_nanos((value * 1e9) as i64);
    }
}

/// Statistics of a [`Timer`] at a point in time.
pub struct TimerSnapshotData {
    count: i64,
    values: Vec<i64>,
    rate1: f64,
    rate5: f64,
    rate15: f64,
    rate_mean: f64,
}

impl TimerSnapshot for TimerSnapshotData {
    fn count(&self) -> i64 {
        self.count
    }

    fn min(&self) -> i64 {
        self.values.first().copied().unwrap_or(0)
    }

    fn max(&self) -> i64 {
        self.values.last().copied().unwrap_or(0)
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        self.values.iter().map(|v| *v as f64).sum::<f64>() / self.values.len() as f64
    }

    fn std_dev(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        let mean = self.mean();
        let variance = self
            .values
            .iter()
            .map(|v| {
                let delta = *v as f64 - mean;
                delta * delta
            })
            .sum::<f64>()
            / self.values.len() as f64;
        variance.sqrt()
    }

    fn percentiles(&self, quantiles: &[f64]) -> Vec<f64> {
        let len = self.values.len();
        quantiles
            .iter()
            .map(|q| {
                if len == 0 {
                    return 0.0;
                }

                // Position is one-based, interpolating linearly between the two closest ranks.
                let pos = q * (len as f64 + 1.0);
                if pos < 1.0 {
                    self.values[0] as f64
                } else if pos >= len as f64 {
                    self.values[len - 1] as f64
                } else {
                    let lower = self.values[pos as usize - 1] as f64;
                    let upper = self.values[pos as usize] as f64;
                    lower + (pos - pos.floor()) * (upper - lower)
                }
            })
            .collect()
    }

    fn rate1(&self) -> f64 {
        self.rate1
    }

    fn rate5(&self) -> f64 {
        self.rate5
    }

    fn rate15(&self) -> f64 {
        self.rate15
    }

    fn rate_mean(&self) -> f64 {
        self.rate_mean
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics::HistogramFn as _;
    use quanta::Clock;

    use super::{Timer, RESERVOIR_SIZE};
    use crate::registry::TimerSnapshot as _;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn empty_snapshot() {
        let timer = Timer::new(Clock::new());
        let snapshot = timer.snapshot();

        assert_eq!(snapshot.count(), 0);
        assert_eq!(snapshot.min(), 0);
        assert_eq!(snapshot.max(), 0);
        assert_close(snapshot.mean(), 0.0);
        assert_close(snapshot.std_dev(), 0.0);
        assert_eq!(snapshot.percentiles(&[0.5, 0.99]), vec![0.0, 0.0]);
    }

    #[test]
    fn snapshot_statistics() {
        let timer = Timer::new(Clock::new());
        for value in (1..=10).rev() {
            timer.update_nanos(value);
        }

        let snapshot = timer.snapshot();
        assert_eq!(snapshot.count(), 10);
        assert_eq!(snapshot.min(), 1);
        assert_eq!(snapshot.max(), 10);
        assert_close(snapshot.mean(), 5.5);
        assert_close(snapshot.std_dev(), 8.25f64.sqrt());

        let percentiles = snapshot.percentiles(&[0.05, 0.5, 0.75, 0.99]);
        assert_close(percentiles[0], 1.0);
        assert_close(percentiles[1], 5.5);
        assert_close(percentiles[2], 8.25);
        assert_close(percentiles[3], 10.0);
    }

    #[test]
    fn reservoir_is_bounded() {
        let timer = Timer::new(Clock::new());
        for value in 0..5_000 {
            timer.update_nanos(value);
        }

        let snapshot = timer.snapshot();
        assert_eq!(snapshot.count(), 5_000);
        assert_eq!(snapshot.values.len(), RESERVOIR_SIZE);
        assert!(snapshot.max() < 5_000);
    }

    #[test]
    fn durations_and_seconds_are_stored_as_nanoseconds() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::new(clock);

        timer.update(Duration::from_micros(250));
        timer.record(0.5);
        let value = timer.time(|| {
            mock.increment(Duration::from_millis(3));
            42
        });
        assert_eq!(value, 42);

        let snapshot = timer.snapshot();
        assert_eq!(snapshot.min(), 250_000);
        assert_eq!(snapshot.max(), 500_000_000);
        assert_eq!(snapshot.percentiles(&[0.5]), vec![3_000_000.0]);
    }

    #[test]
    fn moving_average_rates() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::new(clock);
        for _ in 0..3 {
            timer.update_nanos(1);
        }

        mock.increment(Duration::from_secs(5));
        let snapshot = timer.snapshot();
        assert_close(snapshot.rate1(), 0.6);
        assert_close(snapshot.rate5(), 0.6);
        assert_close(snapshot.rate15(), 0.6);
        assert_close(snapshot.rate_mean(), 0.6);

        // Twelve idle ticks decay the one-minute rate by a factor of e.
        mock.increment(Duration::from_secs(60));
        let snapshot = timer.snapshot();
        assert_close(snapshot.rate1(), 0.6 * (-1.0f64).exp());
        assert_close(snapshot.rate5(), 0.6 * (-0.2f64).exp());
        assert_close(snapshot.rate15(), 0.6 * (-1.0f64 / 15.0).exp());
        assert_close(snapshot.rate_mean(), 3.0 / 65.0);
    }

    #[test]
    fn partial_ticks_are_carried_over() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::new(clock);
        timer.update_nanos(1);

        mock.increment(Duration::from_secs(3));
        assert_close(timer.snapshot().rate1(), 0.0);

        mock.increment(Duration::from_secs(3));
        assert_close(timer.snapshot().rate1(), 0.2);
    }
}
