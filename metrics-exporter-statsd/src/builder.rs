use std::{thread::JoinHandle, time::Duration};

use thiserror::Error;

use crate::{
    client::DEFAULT_BUFFER_SIZE,
    exporter::{ExporterConfiguration, StatsdExporter},
    recorder::StatsdRecorder,
    registry::Registry,
    storage::AtomicRegistry,
};

const DEFAULT_REMOTE_ADDRESS: &str = "127.0.0.1:8125";
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_DURATION_UNIT: Duration = Duration::from_nanos(1);
const EXPORTER_THREAD_NAME: &str = "metrics-exporter-statsd";

/// Errors that could occur while building or installing a StatsD exporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The flush interval was zero.
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,

    /// The duration unit was zero.
    #[error("duration unit must be greater than zero")]
    InvalidDurationUnit,

    /// Failed to spawn the background thread for the exporter.
    #[error("failed to spawn background thread for exporter")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Builder for a StatsD exporter.
pub struct StatsdBuilder {
    remote_addr: String,
    flush_interval: Duration,
    write_timeout: Option<Duration>,
    duration_unit: Duration,
    prefix: String,
    buffer_size: usize,
}

impl StatsdBuilder {
    /// Set the remote address to send metrics to.
    ///
    /// The address needs to be in the format of `<host>:<port>`, where the host is a hostname, an IPv4 address, or a
    /// bracketed IPv6 address. Only the format is checked here: the address is resolved every time the exporter opens a
    /// client, so a host that cannot be resolved fails that export rather than the build.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address is not in the format of `<host>:<port>`, an error will be returned indicating the reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let addr = addr.as_ref();
        parse_remote_address(addr).map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;

        self.remote_addr = addr.to_string();
        Ok(self)
    }

    /// Set the flush interval of the exporter.
    ///
    /// This controls how often the registry is exported. The interval, in seconds, is also sent as the sample rate of
    /// every line: intervals shorter than a second mean lines are randomly sampled, and annotated with the interval.
    ///
    /// Defaults to 1 second.
    ///
    /// # Errors
    ///
    /// If the interval is zero, an error will be returned.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Result<Self, BuildError> {
        if flush_interval.is_zero() {
            return Err(BuildError::InvalidFlushInterval);
        }

        self.flush_interval = flush_interval;
        Ok(self)
    }

    /// Set the write timeout for sending metrics.
    ///
    /// When the write timeout is reached, the send is aborted and the payload being sent at the time is dropped without
    /// retrying. A zero timeout disables it, and sends block until the socket accepts them.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout).filter(|timeout| !timeout.is_zero());
        self
    }

    /// Set the unit that timer durations are reported in.
    ///
    /// Timer minimums, maximums, means, standard deviations and percentiles are divided by this unit before being sent.
    /// For example, a unit of one millisecond reports a 2.5ms duration as `2.5` (or `2` for the integral minimum and
    /// maximum).
    ///
    /// Defaults to 1 nanosecond.
    ///
    /// # Errors
    ///
    /// If the unit is zero, an error will be returned.
    pub fn with_duration_unit(mut self, duration_unit: Duration) -> Result<Self, BuildError> {
        if duration_unit.is_zero() {
            return Err(BuildError::InvalidDurationUnit);
        }

        self.duration_unit = duration_unit;
        Ok(self)
    }

    /// Set the prefix for every metric key.
    ///
    /// Keys are sent as `<prefix>.<name>.<suffix>`. The separator is always written, so an empty prefix yields keys
    /// starting with `.`.
    ///
    /// Defaults to an empty prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = prefix.into();
        self
    }

    /// Set the size of the client's write buffer, which bounds the size of every datagram sent.
    ///
    /// A size of zero selects the default.
    ///
    /// Defaults to 512 bytes.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = if buffer_size == 0 { DEFAULT_BUFFER_SIZE } else { buffer_size };
        self
    }

    fn exporter_config(&self) -> ExporterConfiguration {
        ExporterConfiguration {
            remote_addr: self.remote_addr.clone(),
            flush_interval: self.flush_interval,
            write_timeout: self.write_timeout,
            duration_unit: self.duration_unit,
            prefix: self.prefix.clone(),
            buffer_size: self.buffer_size,
        }
    }

    /// Builds an exporter for the given registry.
    ///
    /// Nothing is sent until [`StatsdExporter::export`] or [`StatsdExporter::run`] is called.
    pub fn build<R>(self, registry: R) -> StatsdExporter<R>
    where
        R: Registry,
    {
        StatsdExporter::new(self.exporter_config(), registry)
    }

    /// Builds an exporter for the given registry and runs it on a background thread.
    ///
    /// The thread exports the registry every flush interval for the remainder of the process.
    ///
    /// # Errors
    ///
    /// If the background thread cannot be spawned, an error will be returned.
    pub fn spawn<R>(self, registry: R) -> Result<JoinHandle<()>, BuildError>
    where
        R: Registry + Send + 'static,
    {
        let exporter = self.build(registry);

        std::thread::Builder::new()
            .name(EXPORTER_THREAD_NAME.to_string())
            .spawn(move || exporter.run())
            .map_err(|_| BuildError::Backend)
    }

    /// Builds and installs the recorder.
    ///
    /// A fresh [`AtomicRegistry`] is created, a [`StatsdRecorder`] over it is installed as the global recorder, and an
    /// exporter for it is spawned on a background thread. The registry is returned so metrics can also be recorded
    /// directly.
    ///
    /// # Errors
    ///
    /// If a global recorder is already installed, or the background thread cannot be spawned, an error will be
    /// returned.
    pub fn install(self) -> Result<AtomicRegistry, BuildError> {
        let registry = AtomicRegistry::new();
        let recorder = StatsdRecorder::new(registry.clone());

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)?;
        self.spawn(registry.clone())?;

        Ok(registry)
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            remote_addr: DEFAULT_REMOTE_ADDRESS.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            duration_unit: DEFAULT_DURATION_UNIT,
            prefix: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Checks that `addr` looks like `<host>:<port>` without resolving it.
fn parse_remote_address(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("'{addr}' is missing a port (expected '<host>:<port>')"))?;

    if host.is_empty() {
        return Err(format!("'{addr}' is missing a host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(format!("IPv6 host in '{addr}' must be enclosed in brackets"));
    }
    if host.contains(char::is_whitespace) {
        return Err(format!("host in '{addr}' contains whitespace"));
    }

    port.parse::<u16>().map(|_| ()).map_err(|e| format!("invalid port '{port}': {e}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_remote_address, BuildError, StatsdBuilder};
    use crate::client::{ClientError, DEFAULT_BUFFER_SIZE};

    #[test]
    fn defaults() {
        let config = StatsdBuilder::default().exporter_config();

        assert_eq!(config.remote_addr, "127.0.0.1:8125");
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.duration_unit, Duration::from_nanos(1));
        assert_eq!(config.prefix, "");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn settings_are_applied() {
        let config = StatsdBuilder::default()
            .with_remote_address("statsd.example.com:9125")
            .and_then(|builder| builder.with_flush_interval(Duration::from_secs(10)))
            .and_then(|builder| builder.with_duration_unit(Duration::from_millis(1)))
            .unwrap()
            .with_write_timeout(Duration::from_millis(250))
            .with_prefix("app")
            .with_buffer_size(1432)
            .exporter_config();

        assert_eq!(config.remote_addr, "statsd.example.com:9125");
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.duration_unit, Duration::from_millis(1));
        assert_eq!(config.prefix, "app");
        assert_eq!(config.buffer_size, 1432);
    }

    #[test]
    fn zero_buffer_size_selects_default() {
        let config = StatsdBuilder::default().with_buffer_size(0).exporter_config();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn zero_write_timeout_disables_it() {
        let config = StatsdBuilder::default().with_write_timeout(Duration::ZERO).exporter_config();
        assert_eq!(config.write_timeout, None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            StatsdBuilder::default().with_remote_address("not an address"),
            Err(BuildError::InvalidRemoteAddress { .. })
        ));
        assert!(matches!(
            StatsdBuilder::default().with_flush_interval(Duration::ZERO),
            Err(BuildError::InvalidFlushInterval)
        ));
        assert!(matches!(
            StatsdBuilder::default().with_duration_unit(Duration::ZERO),
            Err(BuildError::InvalidDurationUnit)
        ));
    }

    #[test]
    fn remote_address_format() {
        // Cases are defined as: address, whether it is accepted.
        let cases = [
            ("127.0.0.1:8125", true),
            ("localhost:8125", true),
            ("statsd.invalid:8125", true),
            ("[::1]:8125", true),
            ("localhost", false),
            (":8125", false),
            ("localhost:", false),
            ("localhost:99999", false),
            ("::1:8125", false),
            ("not an address:8125", false),
        ];

        for (addr, accepted) in cases {
            assert_eq!(parse_remote_address(addr).is_ok(), accepted, "address '{addr}'");
        }
    }

    #[test]
    fn unresolvable_host_fails_at_export_time() {
        let exporter = StatsdBuilder::default()
            .with_remote_address("statsd.invalid:8125")
            .unwrap()
            .build(crate::AtomicRegistry::new());

        assert!(matches!(exporter.export(), Err(ClientError::Transport(_))));
    }
}
