//! Prometheus metrics for the proxy core.
//!
//! The registry is process-global; the HTTP scrape endpoint lives outside
//! this core and reads `metrics().registry`.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    /// Client sessions accepted
    pub sessions_started: IntCounter,
    /// Currently active client sessions
    pub sessions_active: IntGauge,
    /// Queries routed
    pub queries_total: IntCounter,
    /// Queries by routing target (master/slave/all)
    pub queries_routed: IntCounterVec,
    /// Authentication failures
    pub auth_failures: IntCounter,
    /// Transaction replays attempted
    pub trx_replays: IntCounter,
    /// Monitor failovers performed
    pub failovers: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let sessions_started = IntCounter::new(
            "bifrost_sessions_total",
            "Total number of client sessions accepted",
        )
        .expect("metric definition");

        let sessions_active = IntGauge::new(
            "bifrost_sessions_active",
            "Current number of active client sessions",
        )
        .expect("metric definition");

        let queries_total =
            IntCounter::new("bifrost_queries_total", "Total number of queries routed")
                .expect("metric definition");

        let queries_routed = IntCounterVec::new(
            Opts::new(
                "bifrost_queries_routed_total",
                "Queries routed by target kind",
            ),
            &["target"],
        )
        .expect("metric definition");

        let auth_failures = IntCounter::new(
            "bifrost_auth_failures_total",
            "Client authentication failures",
        )
        .expect("metric definition");

        let trx_replays = IntCounter::new(
            "bifrost_trx_replays_total",
            "Transaction replays attempted after backend failure",
        )
        .expect("metric definition");

        let failovers = IntCounter::new(
            "bifrost_failovers_total",
            "Automatic and manual failovers performed",
        )
        .expect("metric definition");

        registry
            .register(Box::new(sessions_started.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(sessions_active.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(queries_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(queries_routed.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(auth_failures.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(trx_replays.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(failovers.clone()))
            .expect("metric registration");

        Self {
            registry,
            sessions_started,
            sessions_active,
            queries_total,
            queries_routed,
            auth_failures,
            trx_replays,
            failovers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_singleton() {
        let m1 = metrics();
        let m2 = metrics();
        assert!(std::ptr::eq(m1, m2));
    }

    #[test]
    fn test_counters_increment() {
        let m = metrics();
        let before = m.queries_total.get();
        m.queries_total.inc();
        assert_eq!(m.queries_total.get(), before + 1);

        m.queries_routed.with_label_values(&["master"]).inc();
        assert!(m.queries_routed.with_label_values(&["master"]).get() >= 1);
    }
}
