//! Prometheus metrics for LDAP-Proxy
//!
//! Named counters for every relay outcome plus the upstream registry snapshot:
//! - Bind counters (requests, OTP/session/credential failures, successes)
//! - Search counters (requests, session failures, upstream errors, successes)
//! - Close counters and upstream connection counters
//! - Per-endpoint status and latency gauges, and the `servers` JSON snapshot

use crate::registry::Registry;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry as PromRegistry,
    TextEncoder,
};
use std::sync::{Arc, RwLock};

/// Metrics registry passed to each relay component
#[derive(Clone)]
pub struct Metrics {
    pub registry: PromRegistry,

    // Bind metrics
    pub bind_reqs: IntCounter,
    pub bind_otp_errors: IntCounter,
    pub bind_session_errors: IntCounter,
    pub bind_errors: IntCounter,
    pub bind_successes: IntCounter,

    // Search metrics
    pub search_reqs: IntCounter,
    pub search_session_errors: IntCounter,
    pub search_errors: IntCounter,
    pub search_successes: IntCounter,

    // Connection metrics
    pub frontend_closes: IntCounter,
    pub backend_closes: IntCounter,
    pub upstream_connections_created: IntCounter,
    pub upstream_dial_errors: IntCounter,
    pub sessions_active: IntGauge,

    // Upstream health
    pub backend_up: IntGaugeVec,
    pub backend_latency_seconds: GaugeVec,
    servers: Arc<RwLock<String>>,
}

fn counter(registry: &PromRegistry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics registry with all metrics registered
    pub fn new() -> prometheus::Result<Self> {
        let registry = PromRegistry::new();

        let bind_reqs = counter(
            &registry,
            "ldap_proxy_bind_reqs_total",
            "Bind requests received, counted before the second factor check",
        )?;
        let bind_otp_errors = counter(
            &registry,
            "ldap_proxy_bind_otp_errors_total",
            "Binds rejected because of an invalid second factor",
        )?;
        let bind_session_errors = counter(
            &registry,
            "ldap_proxy_bind_session_errors_total",
            "Binds that could not obtain an upstream session",
        )?;
        let bind_errors = counter(
            &registry,
            "ldap_proxy_bind_errors_total",
            "Binds rejected by the upstream server",
        )?;
        let bind_successes = counter(
            &registry,
            "ldap_proxy_bind_successes_total",
            "Successful binds",
        )?;

        let search_reqs = counter(
            &registry,
            "ldap_proxy_search_reqs_total",
            "Total search requests",
        )?;
        let search_session_errors = counter(
            &registry,
            "ldap_proxy_search_session_errors_total",
            "Searches that could not obtain an upstream session",
        )?;
        let search_errors = counter(
            &registry,
            "ldap_proxy_search_errors_total",
            "Searches that ended with an upstream error",
        )?;
        let search_successes = counter(
            &registry,
            "ldap_proxy_search_successes_total",
            "Successful searches",
        )?;

        let frontend_closes = counter(
            &registry,
            "ldap_proxy_frontend_closes_total",
            "Client connections closed",
        )?;
        let backend_closes = counter(
            &registry,
            "ldap_proxy_backend_closes_total",
            "Pooled upstream connections closed",
        )?;
        let upstream_connections_created = counter(
            &registry,
            "ldap_proxy_upstream_connections_created_total",
            "Upstream connections opened for sessions",
        )?;
        let upstream_dial_errors = counter(
            &registry,
            "ldap_proxy_upstream_dial_errors_total",
            "Failed attempts to open an upstream session connection",
        )?;

        let sessions_active = IntGauge::new(
            "ldap_proxy_sessions_active",
            "Number of client connections with a pooled upstream connection",
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        let backend_up = IntGaugeVec::new(
            Opts::new("ldap_proxy_backend_up", "Whether the upstream answered the last probe"),
            &["hostname", "port"],
        )?;
        registry.register(Box::new(backend_up.clone()))?;

        let backend_latency_seconds = GaugeVec::new(
            Opts::new(
                "ldap_proxy_backend_latency_seconds",
                "Connect round-trip time measured by the last probe",
            ),
            &["hostname", "port"],
        )?;
        registry.register(Box::new(backend_latency_seconds.clone()))?;

        Ok(Metrics {
            registry,
            bind_reqs,
            bind_otp_errors,
            bind_session_errors,
            bind_errors,
            bind_successes,
            search_reqs,
            search_session_errors,
            search_errors,
            search_successes,
            frontend_closes,
            backend_closes,
            upstream_connections_created,
            upstream_dial_errors,
            sessions_active,
            backend_up,
            backend_latency_seconds,
            servers: Arc::new(RwLock::new("[]".to_string())),
        })
    }

    /// Publish the registry after a probe cycle
    pub fn publish_servers(&self, registry: &Registry) {
        for endpoint in registry.endpoints() {
            let port = endpoint.port.to_string();
            let labels = [endpoint.hostname.as_str(), port.as_str()];
            self.backend_up
                .with_label_values(&labels)
                .set(i64::from(endpoint.is_up()));
            self.backend_latency_seconds
                .with_label_values(&labels)
                .set(endpoint.latency.as_secs_f64());
        }

        let snapshot = registry.snapshot_json();
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        *servers = snapshot;
    }

    /// The last published `servers` snapshot (JSON)
    pub fn servers(&self) -> String {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}
