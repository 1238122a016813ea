use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CHUNKS_PUSHED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "stream_chunks_pushed_total",
        "Chunks appended to session ring buffers",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHUNKS_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "stream_chunks_evicted_total",
        "Chunks dropped from the front of a ring buffer to stay within budget",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BYTES_RETAINED: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "stream_bytes_retained",
            "Bytes currently held by a session ring buffer",
        ),
        &["session"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("stream_connections", "Open viewer connections").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static BACKPRESSURE_STALLS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "stream_backpressure_stalls_total",
        "Times a connection's pending window filled and live sends were withheld",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "stream_resyncs_total",
            "Full snapshot replays and overflow signals sent to viewers",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RANGE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "stream_range_requests_total",
            "Gap-fill range requests handled by the host",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PROTOCOL_NOISE: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "stream_protocol_noise_total",
            "Malformed or out-of-contract client frames that were ignored",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DIMENSION_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "stream_dimension_decisions_total",
            "Terminal geometry negotiations by outcome",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Prometheus text exposition of everything registered so far.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn render_includes_touched_metrics() {
        CHUNKS_PUSHED.inc();
        PROTOCOL_NOISE.with_label_values(&["unknown_frame"]).inc();
        let text = render();
        assert!(text.contains("stream_chunks_pushed_total"));
        assert!(text.contains("stream_protocol_noise_total{kind=\"unknown_frame\"}"));
    }
}
