mod tracker;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec,
    HistogramVec, IntCounterVec,
};

pub use tracker::Tracker;

static VERSION_GAUGE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("transponder_version", "transponder current running version"),
        &["version"]
    )
    .expect("version gauge registration must succeed")
});

static COMMAND_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "transponder_command_total",
            "commands handled by the dispatcher, by outcome"
        ),
        &["command", "result"]
    )
    .expect("command counter registration must succeed")
});

static ERROR_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("transponder_error_total", "proxy side errors by kind"),
        &["kind"]
    )
    .expect("error counter registration must succeed")
});

static TENANT_CONNECTIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!(
            "transponder_tenant_connection",
            "registered client connections per tenant"
        ),
        &["tenant"]
    )
    .expect("tenant connections gauge registration must succeed")
});

static SENTINEL_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "transponder_sentinel_update_total",
            "topology updates received from sentinel listeners"
        ),
        &["kind"]
    )
    .expect("sentinel update counter registration must succeed")
});

static UPSTREAM_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "transponder_upstream_timer",
        "upstream round trip per node in microseconds",
        &["node"],
        vec![1_000.0, 10_000.0, 40_000.0, 100_000.0, 200_000.0]
    )
    .expect("upstream timer histogram registration must succeed")
});

/// Register the running version with metrics.
pub fn register_version(version: &str) {
    VERSION_GAUGE.with_label_values(&[version]).set(1.0);
}

/// Record how the dispatcher disposed of a command.
pub fn command_incr(command: &str, result: &str) {
    COMMAND_TOTAL.with_label_values(&[command, result]).inc();
}

pub fn command_count(command: &str, result: &str) -> u64 {
    COMMAND_TOTAL.with_label_values(&[command, result]).get()
}

pub fn error_incr(kind: &str) {
    ERROR_TOTAL.with_label_values(&[kind]).inc();
}

pub fn error_count(kind: &str) -> u64 {
    ERROR_TOTAL.with_label_values(&[kind]).get()
}

pub fn tenant_connections_set(tenant: &str, current: usize) {
    TENANT_CONNECTIONS
        .with_label_values(&[tenant])
        .set(current as f64);
}

pub fn tenant_connections_current(tenant: &str) -> f64 {
    TENANT_CONNECTIONS.with_label_values(&[tenant]).get()
}

pub fn sentinel_update_incr(kind: &str) {
    SENTINEL_UPDATES.with_label_values(&[kind]).inc();
}

pub fn sentinel_update_count(kind: &str) -> u64 {
    SENTINEL_UPDATES.with_label_values(&[kind]).get()
}

/// Totals of [`command_incr`] per result label, summed over commands.
pub fn command_results() -> HashMap<String, u64> {
    sum_by_label(&COMMAND_TOTAL, "result")
}

pub fn error_total() -> u64 {
    sum_by_label(&ERROR_TOTAL, "kind").values().sum()
}

/// Live registered connections summed over tenants.
pub fn tenant_connections_total() -> u64 {
    TENANT_CONNECTIONS
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_gauge().get_value() as u64)
        .sum()
}

fn sum_by_label(counter: &IntCounterVec, label: &str) -> HashMap<String, u64> {
    let mut sums = HashMap::new();
    for family in counter.collect() {
        for metric in family.get_metric() {
            let Some(pair) = metric.get_label().iter().find(|pair| pair.get_name() == label)
            else {
                continue;
            };
            *sums.entry(pair.get_value().to_string()).or_insert(0) +=
                metric.get_counter().get_value() as u64;
        }
    }
    sums
}

/// Create a tracker for one upstream round trip.
pub fn upstream_tracker(node: &str) -> Tracker {
    Tracker::new(UPSTREAM_TIMER.with_label_values(&[node]))
}
