// src/metrics.rs
//
// Operational telemetry for the DMM daemon itself (queue depth, job
// latency, SDN/metrics-adapter call latency, bandwidth per partner). This
// is distinct from `metrics_adapter.rs`, which is an outbound client that
// reads a time-series backend for link-utilization data.

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// When the observability feature is disabled these macros compile away to
// nothing, so call sites never need a cfg guard of their own.
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Registers descriptions for every metric DMM emits. Call once at startup,
/// before the RPC listener starts accepting connections.
pub fn describe_metrics() {
    describe_gauge!("dmm_up", "Process liveness (1 = up).");

    describe_gauge!(
        "dmm_orchestrator_queue_depth",
        "Number of orchestrator jobs currently queued, across all keys."
    );
    describe_gauge!(
        "dmm_orchestrator_active_jobs",
        "Number of orchestrator jobs currently running."
    );
    describe_histogram!(
        "dmm_orchestrator_job_duration_ms",
        Unit::Milliseconds,
        "Wall-clock duration of an orchestrator job (open/reprovision/close_link), labeled by outcome (ok, error)."
    );

    describe_counter!(
        "dmm_rpc_requests_total",
        Unit::Count,
        "Total RPC requests accepted, labeled by kind (preparer, submitter, finisher)."
    );
    describe_counter!(
        "dmm_rpc_auth_failures_total",
        Unit::Count,
        "Total connections rejected at the HMAC challenge."
    );
    describe_histogram!(
        "dmm_rpc_handler_duration_ms",
        Unit::Milliseconds,
        "Duration of an RPC handler call, labeled by kind."
    );

    describe_histogram!(
        "dmm_sdn_call_duration_ms",
        Unit::Milliseconds,
        "Duration of a call through the SDN adapter, labeled by operation (stage, provision, reprovision, delete, discover)."
    );
    describe_counter!(
        "dmm_sdn_call_errors_total",
        Unit::Count,
        "Total SDN adapter call failures, labeled by operation."
    );

    describe_gauge!(
        "dmm_request_bandwidth_mbps",
        "Promised bandwidth for a request's circuit, in Mb/s, labeled by src_rse and dst_rse."
    );
    describe_gauge!(
        "dmm_site_prio_sum",
        "Sum of live priorities for a site's uplink, labeled by rse_name."
    );
    describe_gauge!(
        "dmm_site_ipv6_pool_free",
        "Number of free IPv6 blocks remaining at a site, labeled by rse_name."
    );

    describe_counter!(
        "dmm_requests_registered_total",
        Unit::Count,
        "Total requests registered via PREPARER."
    );
    describe_counter!(
        "dmm_requests_completed_total",
        Unit::Count,
        "Total requests that reached completion via FINISHER."
    );
    describe_counter!(
        "dmm_persistence_write_failures_total",
        Unit::Count,
        "Total persistence writes that failed and were logged rather than retried."
    );
}
