//! Prometheus metrics collection for rosterd.
//!
//! Tracks registry population, heartbeat throughput, evacuation outcomes,
//! and configuration activity. Exposed on the HTTP `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // Counters (monotonic increasing)
    // ========================================================================

    /// Total registration requests handled (including dedups and resumes).
    pub static ref REGISTRATIONS: IntCounter = IntCounter::new(
        "registry_registrations_total",
        "Registration requests handled"
    ).unwrap();

    /// Total heartbeats processed across both registries.
    pub static ref HEARTBEATS: IntCounter = IntCounter::new(
        "registry_heartbeats_total",
        "Heartbeats processed"
    ).unwrap();

    /// Total evacuation requests sent to backends.
    pub static ref EVACUATIONS_REQUESTED: IntCounter = IntCounter::new(
        "registry_evacuations_requested_total",
        "Evacuation requests sent"
    ).unwrap();

    /// Evacuations that settled successfully.
    pub static ref EVACUATIONS_SUCCEEDED: IntCounter = IntCounter::new(
        "registry_evacuations_succeeded_total",
        "Evacuations settled successfully"
    ).unwrap();

    /// Evacuations that failed or timed out.
    pub static ref EVACUATIONS_FAILED: IntCounter = IntCounter::new(
        "registry_evacuations_failed_total",
        "Evacuations failed or timed out"
    ).unwrap();

    /// Invariant violations surfaced by registry mutations.
    pub static ref INVARIANT_VIOLATIONS: IntCounter = IntCounter::new(
        "registry_invariant_violations_total",
        "Invariant violations surfaced"
    ).unwrap();

    /// Network profile applies that succeeded.
    pub static ref CONFIG_APPLIES: IntCounter = IntCounter::new(
        "registry_config_applies_total",
        "Network profile applies"
    ).unwrap();

    // ========================================================================
    // Gauges (can increase/decrease)
    // ========================================================================

    /// Proxies currently registered (non-DEAD).
    pub static ref REGISTERED_PROXIES: IntGauge = IntGauge::new(
        "registry_proxies",
        "Proxies currently registered"
    ).unwrap();

    /// Backends currently registered (non-DEAD).
    pub static ref REGISTERED_BACKENDS: IntGauge = IntGauge::new(
        "registry_backends",
        "Backends currently registered"
    ).unwrap();
}

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before the HTTP endpoint serves scrapes.
pub fn init() {
    REGISTRY.register(Box::new(REGISTRATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(HEARTBEATS.clone())).unwrap();
    REGISTRY
        .register(Box::new(EVACUATIONS_REQUESTED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVACUATIONS_SUCCEEDED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVACUATIONS_FAILED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVARIANT_VIOLATIONS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(CONFIG_APPLIES.clone())).unwrap();
    REGISTRY
        .register(Box::new(REGISTERED_PROXIES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REGISTERED_BACKENDS.clone()))
        .unwrap();
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
