use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace};

use crate::{
    client::{ClientError, StatsdClient, Transport},
    registry::{Metric, Registry, TimerSnapshot},
};

const TIMER_QUANTILES: [f64; 5] = [0.5, 0.75, 0.95, 0.99, 0.999];
const TIMER_PERCENTILE_SUFFIXES: [&str; 5] =
    ["50-percentile", "75-percentile", "95-percentile", "99-percentile", "999-percentile"];

/// Exporter configuration.
#[derive(Clone)]
pub(crate) struct ExporterConfiguration {
    /// `host:port`, resolved again on every export.
    pub remote_addr: String,
    pub flush_interval: Duration,
    pub write_timeout: Option<Duration>,
    pub duration_unit: Duration,
    pub prefix: String,
    pub buffer_size: usize,
}

/// Periodically reports the contents of a [`Registry`] to a StatsD server.
///
/// Every flush interval, a fresh [`StatsdClient`] is opened, every metric in the registry is written to it, and the
/// client is closed. Counters and gauges produce a single line each, while timers produce fourteen gauge lines: count,
/// min, max, mean, standard deviation, five percentiles, and four rates.
///
/// The remote address is resolved each time a client is opened, so a failed lookup only costs that one export.
///
/// Exports never overlap: if one takes longer than the flush interval, the next one starts as soon as it finishes.
pub struct StatsdExporter<R> {
    config: ExporterConfiguration,
    registry: R,
}

impl<R> StatsdExporter<R>
where
    R: Registry,
{
    pub(crate) fn new(config: ExporterConfiguration, registry: R) -> Self {
        StatsdExporter { config, registry }
    }

    /// Returns the registry being exported.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Runs a single export: opens a client, writes every metric in the registry, and closes the client.
    ///
    /// # Errors
    ///
    /// If the remote address cannot be resolved or the client cannot be opened, [`ClientError::Transport`] is returned
    /// and nothing is sent. If the final flush fails, [`ClientError::Write`] is returned. Failures writing individual
    /// lines are logged but otherwise ignored.
    pub fn export(&self) -> Result<(), ClientError> {
        self.export_with(|| self.open_client())
    }

    /// Exports the registry every flush interval, forever.
    ///
    /// The first export happens one flush interval after this is called. Errors are logged, and the next export
    /// proceeds as scheduled.
    pub fn run(self) -> ! {
        self.run_with(|| self.open_client())
    }

    fn open_client(&self) -> Result<StatsdClient, ClientError> {
        StatsdClient::connect(self.config.remote_addr.as_str(), self.config.buffer_size, self.config.write_timeout)
    }

    fn export_with<T, F>(&self, open: F) -> Result<(), ClientError>
    where
        T: Transport,
        F: FnOnce() -> Result<StatsdClient<T>, ClientError>,
    {
        let client = open()?;
        self.write_registry(&client);
        client.close()
    }

    pub(crate) fn run_with<T, F>(&self, mut open: F) -> !
    where
        T: Transport,
        F: FnMut() -> Result<StatsdClient<T>, ClientError>,
    {
        let mut next_flush = Instant::now() + self.config.flush_interval;
        loop {
            // If the previous export took longer than the flush interval, we won't sleep at all.
            if let Some(sleep_duration) = next_flush.checked_duration_since(Instant::now()) {
                sleep(sleep_duration);
            }

            next_flush = Instant::now() + self.config.flush_interval;

            let started = Instant::now();
            match self.export_with(&mut open) {
                Ok(()) => debug!(elapsed = ?started.elapsed(), "Finished exporting metrics."),
                Err(e) => error!(
                    error = %e,
                    remote_addr = %self.config.remote_addr,
                    "Failed to export metrics."
                ),
            }
        }
    }

    pub(crate) fn write_registry<T: Transport>(&self, client: &StatsdClient<T>) {
        let mut metrics_written = 0usize;
        for (name, metric) in self.registry.entries() {
            self.write_metric(client, &name, metric);
            metrics_written += 1;
        }

        trace!(metrics_written, "Wrote registry to client.");
    }

    fn write_metric<T: Transport>(&self, client: &StatsdClient<T>, name: &str, metric: Metric) {
        // The sample rate handed to the client is the flush interval in seconds: intervals under a second sample lines.
        let rate = self.config.flush_interval.as_secs_f64();

        match metric {
            Metric::Counter(count) => {
                let key = self.metric_key(name, "count");
                log_failure(&key, client.increment(&key, count, rate));
            }
            Metric::Gauge(value) => {
                let key = self.metric_key(name, "value");
                log_failure(&key, client.gauge_int(&key, value, rate));
            }
            Metric::GaugeFloat64(value) => {
                let key = self.metric_key(name, "value");
                log_failure(&key, client.gauge_float(&key, value, rate));
            }
            Metric::Timer(snapshot) => self.write_timer(client, name, snapshot.as_ref(), rate),
        }
    }

    fn write_timer<T: Transport>(
        &self,
        client: &StatsdClient<T>,
        name: &str,
        snapshot: &dyn TimerSnapshot,
        rate: f64,
    ) {
        let unit_nanos = self.config.duration_unit.as_nanos();
        let unit_int = i64::try_from(unit_nanos).unwrap_or(i64::MAX).max(1);
        let unit_float = unit_nanos as f64;

        let int_gauges = [
            ("count", snapshot.count()),
            ("min", snapshot.min() / unit_int),
            ("max", snapshot.max() / unit_int),
        ];
        for (suffix, value) in int_gauges {
            let key = self.metric_key(name, suffix);
            log_failure(&key, client.gauge_int(&key, value, rate));
        }

        let percentiles = snapshot.percentiles(&TIMER_QUANTILES);
        let scaled = [("mean", snapshot.mean()), ("std-dev", snapshot.std_dev())]
            .into_iter()
            .chain(TIMER_PERCENTILE_SUFFIXES.into_iter().zip(percentiles));
        let rates = [
            ("one-minute", snapshot.rate1()),
            ("five-minute", snapshot.rate5()),
            ("fifteen-minute", snapshot.rate15()),
            ("mean-rate", snapshot.rate_mean()),
        ];

        let float_gauges = scaled.map(|(suffix, value)| (suffix, value / unit_float)).chain(rates);
        for (suffix, value) in float_gauges {
            let key = self.metric_key(name, suffix);
            log_failure(&key, client.gauge_float(&key, value, rate));
        }
    }

    fn metric_key(&self, name: &str, suffix: &str) -> String {
        format!("{}.{name}.{suffix}", self.config.prefix)
    }
}

fn log_failure(key: &str, result: Result<(), ClientError>) {
    if let Err(e) = result {
        debug!(error = %e, metric_key = key, "Failed to write metric line.");
    }
}
