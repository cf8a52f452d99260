//! Prometheus metrics collection for jailwarden.
//!
//! Exposed on the metrics port as `/metrics`. Recording helpers are no-ops
//! until [`init`] has run, so library users and tests that never call it
//! pay nothing.
//!
//! - `jailwarden_daemon_commands_total{program,result}` - external processes run
//! - `jailwarden_daemon_command_duration_seconds{program}` - process latency
//! - `jailwarden_probes_total{result}` - runtime probes by outcome
//! - `jailwarden_probe_duration_seconds` - probe latency histogram
//! - `jailwarden_cache_lookups_total{result}` - hit / miss / stale
//! - `jailwarden_actions_total{action,result}` - control actions
//! - `jailwarden_agent_pushes_total{result}` - agent pushes by outcome

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Enforcement daemon
// ========================================================================

/// External processes run, by program and result.
pub static DAEMON_COMMANDS: OnceLock<IntCounterVec> = OnceLock::new();

/// External process latency by program.
pub static DAEMON_COMMAND_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// External processes currently running.
pub static PROCESSES_IN_FLIGHT: OnceLock<IntGauge> = OnceLock::new();

/// Runtime probes by result (enabled, disabled, timeout, error).
pub static PROBES: OnceLock<IntCounterVec> = OnceLock::new();

pub static PROBE_LATENCY: OnceLock<Histogram> = OnceLock::new();

// ========================================================================
// Engine
// ========================================================================

/// Cache lookups by result.
pub static CACHE_LOOKUPS: OnceLock<IntCounterVec> = OnceLock::new();

/// Control actions by kind and result.
pub static ACTIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Agent pushes by result.
pub static AGENT_PUSHES: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            if $metric.get().is_none() {
                let m = $init.expect(concat!(stringify!($metric), " creation failed"));
                if let Err(e) = r.register(Box::new(m.clone())) {
                    tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                }
                let _ = $metric.set(m);
            }
        };
    }

    register!(DAEMON_COMMANDS, IntCounterVec::new(Opts::new("jailwarden_daemon_commands_total", "External daemon commands run"), &["program", "result"]));
    register!(DAEMON_COMMAND_LATENCY, HistogramVec::new(
        HistogramOpts::new("jailwarden_daemon_command_duration_seconds", "External daemon command latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["program"]));
    register!(PROCESSES_IN_FLIGHT, IntGauge::new("jailwarden_processes_in_flight", "External processes currently running"));
    register!(PROBES, IntCounterVec::new(Opts::new("jailwarden_probes_total", "Runtime jail probes by result"), &["result"]));
    register!(PROBE_LATENCY, Histogram::with_opts(
        HistogramOpts::new("jailwarden_probe_duration_seconds", "Runtime jail probe latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])));
    register!(CACHE_LOOKUPS, IntCounterVec::new(Opts::new("jailwarden_cache_lookups_total", "Cache lookups by result"), &["result"]));
    register!(ACTIONS, IntCounterVec::new(Opts::new("jailwarden_actions_total", "Control actions by kind and result"), &["action", "result"]));
    register!(AGENT_PUSHES, IntCounterVec::new(Opts::new("jailwarden_agent_pushes_total", "Agent snapshot pushes by result"), &["result"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Recording helpers
// ============================================================================

fn inc_counter_vec(metric: &OnceLock<IntCounterVec>, labels: &[&str]) {
    if let Some(c) = metric.get() {
        c.with_label_values(labels).inc();
    }
}

/// Record one external process run.
#[inline]
pub fn record_daemon_command(program: &str, result: &str, duration_secs: f64) {
    inc_counter_vec(&DAEMON_COMMANDS, &[program, result]);
    if let Some(h) = DAEMON_COMMAND_LATENCY.get() {
        h.with_label_values(&[program]).observe(duration_secs);
    }
}

#[inline]
pub fn process_started() {
    if let Some(g) = PROCESSES_IN_FLIGHT.get() {
        g.inc();
    }
}

#[inline]
pub fn process_finished() {
    if let Some(g) = PROCESSES_IN_FLIGHT.get() {
        g.dec();
    }
}

/// Record a probe outcome.
#[inline]
pub fn record_probe(result: &str, duration_secs: f64) {
    inc_counter_vec(&PROBES, &[result]);
    if let Some(h) = PROBE_LATENCY.get() {
        h.observe(duration_secs);
    }
}

#[inline]
pub fn record_cache_lookup(result: &str) {
    inc_counter_vec(&CACHE_LOOKUPS, &[result]);
}

#[inline]
pub fn record_action(action: &str, result: &str) {
    inc_counter_vec(&ACTIONS, &[action, result]);
}

#[inline]
pub fn record_agent_push(result: &str) {
    inc_counter_vec(&AGENT_PUSHES, &[result]);
}
