//! Prometheus metrics for the DEP assigner
//!
//! Registered in the default registry and rendered by [`encode_metrics`].
//! Counters are process-local: the daemon writes them to a textfile after
//! every pass ([`write_metrics_file`]), and the `metrics` subcommand prints
//! them after running a pass of its own.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

lazy_static! {
    /// Counter: per-device profile assignment results by bucket
    pub static ref ASSIGN_RESULTS: CounterVec = register_counter_vec!(
        "dep_assign_results_total",
        "Profile assignment results by result bucket",
        &["result"]
    )
    .expect("Failed to create assign_results metric");

    /// Counter: device events seen in sync pages by classification
    pub static ref DEVICE_EVENTS: CounterVec = register_counter_vec!(
        "dep_device_events_total",
        "Device events seen in DEP sync pages by classification",
        &["op"]
    )
    .expect("Failed to create device_events metric");

    /// Counter: assigner passes by status
    pub static ref RUNS: CounterVec = register_counter_vec!(
        "dep_assigner_runs_total",
        "Assigner passes by status",
        &["status"]
    )
    .expect("Failed to create runs metric");

    /// Histogram: assigner pass duration (seconds)
    pub static ref RUN_DURATION: Histogram = register_histogram!(
        "dep_assigner_run_duration_seconds",
        "Duration of assigner passes",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create run_duration metric");

    /// Gauge: 1 while Apple Business Manager terms are unsigned
    pub static ref TERMS_EXPIRED: Gauge = register_gauge!(
        "dep_terms_expired",
        "Whether Apple Business Manager terms are currently unsigned (1 = expired)"
    )
    .expect("Failed to create terms_expired metric");

    /// Counter: DEP API errors by kind
    pub static ref API_ERRORS: CounterVec = register_counter_vec!(
        "dep_api_errors_total",
        "DEP API errors by kind",
        &["kind"]
    )
    .expect("Failed to create api_errors metric");

    /// Counter: failed host ingestions
    pub static ref INGEST_ERRORS: Counter = register_counter!(
        "dep_ingest_errors_total",
        "Failed attempts to create hosts from DEP devices"
    )
    .expect("Failed to create ingest_errors metric");
}

/// Add a page's assignment result counts
pub fn record_assign_results(counts: &BTreeMap<&'static str, usize>) {
    for (result, count) in counts {
        ASSIGN_RESULTS
            .with_label_values(&[*result])
            .inc_by(*count as f64);
    }
}

/// Add device events of one classification
pub fn record_device_events(op: &str, count: usize) {
    if count > 0 {
        DEVICE_EVENTS.with_label_values(&[op]).inc_by(count as f64);
    }
}

/// Record a finished assigner pass
pub fn record_run(status: &str, duration_secs: f64) {
    RUNS.with_label_values(&[status]).inc();
    RUN_DURATION.observe(duration_secs);
}

pub fn set_terms_expired(expired: bool) {
    TERMS_EXPIRED.set(if expired { 1.0 } else { 0.0 });
}

pub fn record_api_error(kind: &str) {
    API_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_ingest_error() {
    INGEST_ERRORS.inc();
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::AssignerError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::AssignerError::Other(format!("Metrics are not UTF-8: {}", e)))
}

/// Write the current metrics to `path` for a textfile collector
///
/// The file is replaced atomically so a scrape never sees a partial write.
pub fn write_metrics_file(path: &Path) -> crate::Result<()> {
    let text = encode_metrics()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(text.as_bytes())?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
