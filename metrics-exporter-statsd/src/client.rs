use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use parking_lot::Mutex;
use rand::{Rng as _, SeedableRng as _};
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;
use tracing::{trace, warn};

/// Default size of the write buffer, and so the largest datagram the client will send.
///
/// See the [multi-metric packets][mmp] section of the StatsD documentation for guidance on choosing a size.
///
/// [mmp]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md#multi-metric-packets
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Errors that could occur while talking to a StatsD server.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to resolve the remote address or to set up the UDP socket.
    #[error("failed to open transport: {0}")]
    Transport(#[source] io::Error),

    /// Failed to write a payload to the transport.
    #[error("failed to write payload: {0}")]
    Write(#[source] io::Error),
}

/// A datagram-oriented sink for payloads.
///
/// Every call to `send` is expected to transmit the given bytes as a single unit, such as one UDP datagram.
pub trait Transport {
    /// Sends a single payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be sent, an error is returned.
    fn send(&mut self, payload: &[u8]) -> io::Result<usize>;
}

impl Transport for UdpSocket {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, payload)
    }
}

#[derive(Clone, Copy)]
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "|c",
            MetricType::Gauge => "|g",
        }
    }
}

/// Formats a floating-point value with the fewest digits that still round-trip, and never in exponent form.
pub(crate) fn format_float(value: f64) -> String {
    // `Display` for `f64` is the shortest round-trippable representation and never uses scientific notation.
    value.to_string()
}

struct Inner<T> {
    transport: T,
    buf: Vec<u8>,
    capacity: usize,
    rng: Xoshiro256PlusPlus,
}

impl<T: Transport> Inner<T> {
    /// Returns `true` if a line sent at the given rate should be kept.
    fn sample(&mut self, rate: f64) -> bool {
        self.rng.random::<f64>() < rate
    }

    fn flush(&mut self) -> Result<(), ClientError> {
        if self.buf.is_empty() {
            return Ok(());
        }

        // Buffered lines are dropped whether or not the send succeeds.
        let result = self.transport.send(&self.buf);
        trace!(payload_len = self.buf.len(), "Flushed payload.");
        self.buf.clear();

        result.map(|_| ()).map_err(ClientError::Write)
    }

    fn flush_before_write(&mut self) {
        let payload_len = self.buf.len();
        if let Err(e) = self.flush() {
            warn!(error = %e, payload_len, "Failed to flush payload before buffering the next line.");
        }
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), ClientError> {
        // A line that can never fit goes out on its own rather than being split across payloads.
        if line.len() > self.capacity {
            self.flush_before_write();
            return self.transport.send(line).map(|_| ()).map_err(ClientError::Write);
        }

        let separator_len = usize::from(!self.buf.is_empty());
        if self.capacity - self.buf.len() < line.len() + separator_len {
            self.flush_before_write();
        }

        if !self.buf.is_empty() {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(line);

        Ok(())
    }
}

/// A buffered StatsD client.
///
/// Lines are accumulated in a bounded buffer and sent together, newline-delimited, as a single datagram once the next
/// line would no longer fit, when [`flush`][Self::flush] is called, or when the client is closed. A line is never split
/// across datagrams.
///
/// Sending is serialized: the buffer and transport sit behind a single lock, so a client may be shared between threads
/// but only one line or flush is ever in flight at a time.
///
/// Buffered lines that have not been flushed are discarded if the client is dropped without calling
/// [`close`][Self::close].
pub struct StatsdClient<T = UdpSocket> {
    prefix: String,
    inner: Mutex<Inner<T>>,
}

impl StatsdClient<UdpSocket> {
    /// Opens a client to the given address with the default buffer size.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, or the UDP socket cannot be created and connected, an error is returned.
    pub fn open<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        Self::open_with_buffer_size(addr, DEFAULT_BUFFER_SIZE)
    }

    /// Opens a client to the given address, buffering up to `buffer_size` bytes per datagram.
    ///
    /// A `buffer_size` of zero selects [`DEFAULT_BUFFER_SIZE`].
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, or the UDP socket cannot be created and connected, an error is returned.
    pub fn open_with_buffer_size<A: ToSocketAddrs>(
        addr: A,
        buffer_size: usize,
    ) -> Result<Self, ClientError> {
        Self::connect(addr, buffer_size, None)
    }

    /// Opens a client to the given address with the default buffer size, bounding how long each send may block.
    ///
    /// A send that does not complete within `timeout` fails with [`ClientError::Write`], and the payload being sent is
    /// dropped.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, the UDP socket cannot be created and connected, or `timeout` is zero, an error
    /// is returned.
    pub fn open_with_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self, ClientError> {
        Self::connect(addr, DEFAULT_BUFFER_SIZE, Some(timeout))
    }

    pub(crate) fn connect<A: ToSocketAddrs>(
        addr: A,
        buffer_size: usize,
        write_timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let addrs = addr.to_socket_addrs().map_err(ClientError::Transport)?.collect::<Vec<_>>();
        let first = addrs.first().ok_or_else(|| {
            ClientError::Transport(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address did not resolve to any socket addresses",
            ))
        })?;

        let local_addr = if first.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(local_addr)
            .and_then(|socket| {
                socket.connect(&addrs[..])?;
                socket.set_write_timeout(write_timeout)?;
                Ok(socket)
            })
            .map_err(ClientError::Transport)?;

        Ok(Self::with_transport(socket, buffer_size))
    }
}

impl<T: Transport> StatsdClient<T> {
    /// Creates a client over an already established transport.
    ///
    /// A `buffer_size` of zero selects [`DEFAULT_BUFFER_SIZE`].
    pub fn with_transport(transport: T, buffer_size: usize) -> Self {
        let capacity = if buffer_size == 0 { DEFAULT_BUFFER_SIZE } else { buffer_size };

        StatsdClient {
            prefix: String::new(),
            inner: Mutex::new(Inner {
                transport,
                buf: Vec::with_capacity(capacity),
                capacity,
                rng: Xoshiro256PlusPlus::from_rng(&mut rand::rng()),
            }),
        }
    }

    /// Sets a prefix that is prepended, as-is, to every key.
    ///
    /// Include a trailing `.` if the prefix should be separated from the key.
    #[must_use]
    pub fn with_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Seeds the random number generator used for sampling, making sampling decisions reproducible.
    #[must_use]
    pub fn with_rng_seed(self, seed: u64) -> Self {
        self.inner.lock().rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Sends a counter line, `key:count|c`.
    ///
    /// # Errors
    ///
    /// If the line had to be sent directly and the transport failed, an error is returned.
    pub fn increment(&self, key: &str, count: i64, rate: f64) -> Result<(), ClientError> {
        let mut int_writer = itoa::Buffer::new();
        self.send(key, int_writer.format(count), MetricType::Counter, rate)
    }

    /// Sends an integer gauge line, `key:value|g`.
    ///
    /// # Errors
    ///
    /// If the line had to be sent directly and the transport failed, an error is returned.
    pub fn gauge_int(&self, key: &str, value: i64, rate: f64) -> Result<(), ClientError> {
        let mut int_writer = itoa::Buffer::new();
        self.send(key, int_writer.format(value), MetricType::Gauge, rate)
    }

    /// Sends a floating-point gauge line, `key:value|g`.
    ///
    /// The value is written with the fewest digits needed to round-trip, without exponent notation.
    ///
    /// # Errors
    ///
    /// If the line had to be sent directly and the transport failed, an error is returned.
    pub fn gauge_float(&self, key: &str, value: f64, rate: f64) -> Result<(), ClientError> {
        self.send(key, &format_float(value), MetricType::Gauge, rate)
    }

    /// Sends any buffered lines immediately.
    ///
    /// Does nothing if the buffer is empty.
    ///
    /// # Errors
    ///
    /// If the transport fails to send the payload, an error is returned. The buffered lines are discarded either way.
    pub fn flush(&self) -> Result<(), ClientError> {
        self.inner.lock().flush()
    }

    /// Flushes any buffered lines and releases the transport.
    ///
    /// # Errors
    ///
    /// If the final flush fails, an error is returned. The transport is released regardless.
    pub fn close(self) -> Result<(), ClientError> {
        let mut inner = self.inner.into_inner();
        inner.flush()
    }

    fn send(&self, key: &str, value: &str, metric_type: MetricType, rate: f64) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();

        if rate < 1.0 && !inner.sample(rate) {
            trace!(key, rate, "Line suppressed by sampling.");
            return Ok(());
        }

        let mut line = String::with_capacity(self.prefix.len() + key.len() + value.len() + 16);
        line.push_str(&self.prefix);
        line.push_str(key);
        line.push(':');
        line.push_str(value);
        line.push_str(metric_type.as_str());
        if rate < 1.0 {
            line.push_str("|@");
            line.push_str(&format_float(rate));
        }

        inner.write_line(line.as_bytes())
    }
}
