//! A [`metrics`]-compatible exporter for periodically sending a registry of metrics to a [StatsD][statsd] server.
//!
//! [statsd]: https://github.com/statsd/statsd
//!
//! # Usage
//!
//! The simplest way to use the exporter is to install it as the global recorder:
//!
//! ```no_run
//! # use metrics_exporter_statsd::StatsdBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure the remote address, how often metrics are exported, the prefix for every metric key,
//! // and the unit timer durations are reported in.
//! let builder = StatsdBuilder::default().with_prefix("app");
//!
//! // Installing the exporter sets it as the global recorder for all `metrics` calls, and spawns a background thread
//! // that exports every metric once per flush interval.
//! let registry = builder.install().expect("failed to install recorder/exporter");
//!
//! // The registry backing the recorder is returned, and can be used to record metrics directly.
//! registry.gauge("queue_depth").update(42);
//! ```
//!
//! Any type implementing [`Registry`] can be exported, without going through a recorder at all:
//!
//! ```no_run
//! # use metrics_exporter_statsd::{AtomicRegistry, StatsdBuilder};
//! let registry = AtomicRegistry::new();
//! registry.counter("requests").inc(1);
//!
//! let exporter = StatsdBuilder::default().build(registry);
//! exporter.export().expect("failed to export metrics");
//! ```
//!
//! # Wire format
//!
//! Every metric is sent as one or more lines of the form `<key>:<value>|<type>[|@<rate>]`, where the type is `c` for
//! counters and `g` for everything else. Keys are `<prefix>.<name>.<suffix>`:
//!
//! - counters are sent as `<name>.count`
//! - gauges are sent as `<name>.value`
//! - timers are sent as fourteen gauges: `count`, `min`, `max`, `mean`, `std-dev`, the `50`, `75`, `95`, `99` and
//!   `999-percentile`, and the `one-minute`, `five-minute`, `fifteen-minute` and `mean-rate` rates
//!
//! Lines are newline-delimited and batched into datagrams no larger than the configured buffer size.
//!
//! # Sampling
//!
//! The flush interval, in seconds, is sent as the sample rate of every line. Intervals of a second or more send every
//! line unannotated. Shorter intervals send each line with a probability equal to the interval in seconds, and
//! annotate the lines that are sent with `|@<rate>`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, StatsdBuilder};

mod client;
pub use self::client::{ClientError, StatsdClient, Transport, DEFAULT_BUFFER_SIZE};

mod exporter;
pub use self::exporter::StatsdExporter;

mod recorder;
pub use self::recorder::StatsdRecorder;

mod registry;
pub use self::registry::{Metric, Registry, TimerSnapshot};

mod storage;
pub use self::storage::{AtomicCounter, AtomicGauge, AtomicGaugeFloat, AtomicRegistry};

mod timer;
pub use self::timer::{Timer, TimerSnapshotData};
