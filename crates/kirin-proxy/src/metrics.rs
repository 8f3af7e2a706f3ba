use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request counters
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("kirin_requests_total", "Requests by service and outcome"),
        &["service", "outcome"],
    )
    .unwrap()
});

// Challenge counters
pub static CHALLENGES_ISSUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("kirin_challenges_issued_total", "Payment challenges issued"),
        &["service"],
    )
    .unwrap()
});

pub static MINT_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "kirin_mint_failures_total",
            "Challenges that could not be minted",
        ),
        &["service"],
    )
    .unwrap()
});

pub static DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("kirin_denials_total", "Authentication denials by reason"),
        &["reason"],
    )
    .unwrap()
});

// Proxy metrics
pub static FORWARDED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("kirin_forwarded_total", "Requests forwarded upstream"),
        &["service"],
    )
    .unwrap()
});

pub static UPSTREAM_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("kirin_upstream_latency_seconds", "Upstream request latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["service"],
    )
    .unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(CHALLENGES_ISSUED.clone()))
            .unwrap();
        REGISTRY.register(Box::new(MINT_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(DENIALS.clone())).unwrap();
        REGISTRY
            .register(Box::new(FORWARDED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(UPSTREAM_LATENCY.clone()))
            .unwrap();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        register_metrics();
        register_metrics();
        DENIALS.with_label_values(&["bad_signature"]).inc();
        let text = prometheus::TextEncoder::new()
            .encode_to_string(&REGISTRY.gather())
            .unwrap();
        assert!(text.contains("kirin_denials_total{reason=\"bad_signature\"}"));
    }
}
