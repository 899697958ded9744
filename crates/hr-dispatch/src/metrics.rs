//! Dispatcher metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! binary installs a recorder.

use metrics::{counter, gauge};

/// `source` label for requests whose path names no registered integration
pub const UNKNOWN_SOURCE_LABEL: &str = "unknown";

/// One inbound request and how it was answered
pub fn record_request(source: &'static str, outcome: &'static str) {
    counter!(
        "hookrelay_requests_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Terminal result of background processing
pub fn record_processing(source: &str, success: bool) {
    let result = if success { "completed" } else { "failed" };
    counter!(
        "hookrelay_processing_total",
        "source" => source.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_in_flight(count: usize) {
    gauge!("hookrelay_in_flight").set(count as f64);
}
