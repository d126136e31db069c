// src/core/metrics.rs

//! Ambient Prometheus metrics (SPEC_FULL.md §1.5 — distinct from the spec's
//! excluded "Prometheus query adapter" Non-goal, which is about *consuming*
//! cluster metrics, not *emitting* process metrics). Registration pattern
//! and `gather_metrics` adapted from the teacher's `core/metrics.rs`, with
//! `lazy_static!` swapped for `once_cell::sync::Lazy` (the idiom
//! `core/client_factory` already uses for its own lazily-built state, and a
//! dependency this crate actually carries); the gauges/counters themselves
//! are this crate's own.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    Counter, CounterVec, Gauge, GaugeVec, Histogram, TextEncoder,
};

/// Informers currently tracked, labeled by lifecycle state.
pub static INFORMERS_BY_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "clustermux_informers_by_state",
        "Number of informers currently in each lifecycle state.",
        &["state"]
    )
    .unwrap()
});

pub static INFORMER_RESYNCS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_informer_resyncs_total",
        "Total number of informer relist/resync attempts across all keys."
    )
    .unwrap()
});

pub static COALESCER_TRACKED_KEYS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "clustermux_coalescer_tracked_keys",
        "Number of informer keys currently tracked by the event coalescer."
    )
    .unwrap()
});

pub static COALESCER_CALLBACKS_FIRED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_coalescer_callbacks_fired_total",
        "Total number of coalescer callback invocations across all ticks."
    )
    .unwrap()
});

pub static SSE_SUBSCRIPTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "clustermux_sse_subscriptions",
        "Number of currently open SSE subscriptions."
    )
    .unwrap()
});

pub static SSE_FRAMES_SENT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_sse_frames_sent_total",
        "Total number of SSE data frames written to clients."
    )
    .unwrap()
});

pub static SSE_FRAMES_DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_sse_frames_dropped_total",
        "Total number of SSE frames dropped due to a full per-subscriber queue."
    )
    .unwrap()
});

pub static SSE_SLOW_CLIENTS_DISCONNECTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_sse_slow_clients_disconnected_total",
        "Total number of SSE subscriptions terminated for exceeding the lag threshold."
    )
    .unwrap()
});

pub static EXEC_SESSIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "clustermux_exec_sessions",
        "Number of currently open websocket exec sessions."
    )
    .unwrap()
});

pub static PORTFORWARD_SESSIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "clustermux_portforward_sessions",
        "Number of currently open port-forward sessions."
    )
    .unwrap()
});

pub static PORTFORWARD_BYTES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clustermux_portforward_bytes_total",
        "Total bytes relayed through port-forward tunnels, labeled by direction.",
        &["direction"]
    )
    .unwrap()
});

pub static CLOUDSHELL_PODS_DELETED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_cloudshell_pods_deleted_total",
        "Total number of stale cloud-shell pods deleted by the reaper."
    )
    .unwrap()
});

pub static CLOUDSHELL_SCAN_ERRORS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "clustermux_cloudshell_scan_errors_total",
        "Total number of errors encountered during cloud-shell reaper scans."
    )
    .unwrap()
});

pub static TRACE_RING_SIZE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "clustermux_trace_ring_size",
        "Current number of spans held in the trace ring."
    )
    .unwrap()
});

pub static HTTP_REQUEST_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "clustermux_http_request_latency_seconds",
        "Latency of HTTP request handling in seconds."
    )
    .unwrap()
});

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_produces_nonempty_output() {
        COALESCER_TRACKED_KEYS.set(3.0);
        let text = gather_metrics();
        assert!(text.contains("clustermux_coalescer_tracked_keys"));
    }
}
