// Prometheus metrics for the referee and the sandbox runner.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Matches currently held by a match store or headless runner.
    pub static ref ACTIVE_MATCHES: IntGauge =
        IntGauge::new("pac_active_matches", "Matches currently in progress").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Finished matches, by result (player, opponent, draw).
    pub static ref MATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pac_matches_total", "Finished matches"),
        &["result"],
    )
    .unwrap();

    /// Bot invocations, by strategy and outcome (ok, timeout, crash, unavailable).
    pub static ref SANDBOX_INVOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pac_sandbox_invocations_total", "Bot invocations"),
        &["strategy", "outcome"],
    )
    .unwrap();

    /// Hand-offs from one isolation strategy to another.
    pub static ref SANDBOX_FALLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pac_sandbox_fallbacks_total", "Isolation strategy fallbacks"),
        &["from", "to"],
    )
    .unwrap();

    pub static ref PACS_KILLED_TOTAL: IntCounter =
        IntCounter::new("pac_pacs_killed_total", "Pacs eaten by a dominant enemy").unwrap();

    pub static ref COLLISIONS_TOTAL: IntCounter =
        IntCounter::new("pac_collisions_total", "Movement collisions rolled back").unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Wall time of a single bot invocation, by strategy.
    pub static ref SANDBOX_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("pac_sandbox_duration_seconds", "Bot invocation wall time")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["strategy"],
    )
    .unwrap();

    /// Wall time of a full turn: both bots plus the engine step.
    pub static ref TURN_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("pac_turn_duration_seconds", "Full turn wall time")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_MATCHES.clone()),
        Box::new(MATCHES_TOTAL.clone()),
        Box::new(SANDBOX_INVOCATIONS_TOTAL.clone()),
        Box::new(SANDBOX_FALLBACKS_TOTAL.clone()),
        Box::new(PACS_KILLED_TOTAL.clone()),
        Box::new(COLLISIONS_TOTAL.clone()),
        Box::new(SANDBOX_DURATION_SECONDS.clone()),
        Box::new(TURN_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        match REGISTRY.register(c) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_is_harmless() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_gather_contains_counters() {
        register_metrics().unwrap();
        MATCHES_TOTAL.with_label_values(&["draw"]).inc();
        SANDBOX_INVOCATIONS_TOTAL
            .with_label_values(&["process", "ok"])
            .inc();
        let output = gather_metrics().unwrap();
        assert!(output.contains("pac_matches_total"));
        assert!(output.contains("pac_sandbox_invocations_total"));
    }

    #[test]
    fn test_metric_increments() {
        ACTIVE_MATCHES.inc();
        assert!(ACTIVE_MATCHES.get() >= 1);
        ACTIVE_MATCHES.dec();

        let before = COLLISIONS_TOTAL.get();
        COLLISIONS_TOTAL.inc_by(2);
        assert!(COLLISIONS_TOTAL.get() >= before + 2);

        SANDBOX_FALLBACKS_TOTAL
            .with_label_values(&["container", "process"])
            .inc();
        SANDBOX_DURATION_SECONDS
            .with_label_values(&["container"])
            .observe(0.2);
        TURN_DURATION_SECONDS.observe(0.05);
    }
}
