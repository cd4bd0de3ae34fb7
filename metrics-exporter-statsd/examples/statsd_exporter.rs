use std::{thread::sleep, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_exporter_statsd::StatsdBuilder;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

fn main() {
    tracing_subscriber::fmt::init();

    let registry = StatsdBuilder::default()
        .with_remote_address("localhost:8125")
        .expect("failed to parse remote address")
        .with_flush_interval(Duration::from_secs(5))
        .expect("invalid flush interval")
        .with_duration_unit(Duration::from_millis(1))
        .expect("invalid duration unit")
        .with_prefix("example")
        .install()
        .expect("failed to install StatsD recorder");

    counter!("idle_metric").increment(1);
    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs", "system" => "foo");
    let work_timer = registry.timer("work");

    let mut rng = Xoshiro256StarStar::from_rng(&mut rand::rng());

    // Loop over and over, pretending to do some work.
    loop {
        server_loops.increment(1);
        server_loops_delta_secs.record(rng.random_range(0.0..0.01));

        let pause = Duration::from_micros(rng.random_range(100..5_000));
        work_timer.time(|| sleep(pause));

        registry.gauge("queue_depth").update(rng.random_range(0..100));
    }
}
